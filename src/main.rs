use anstyle;
use chrono;
use clap::Parser;
use rayon::prelude::*;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process;

use osm_changegen::db::{ConnParams, PgSource};
use osm_changegen::generator::{self, Options};
use osm_changegen::osm::MemberSpelling;
use osm_changegen::osmpbf;

macro_rules! printlnt {
    ($($arg:tt)*) => {
        println!("{} {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), format_args!($($arg)*));
    };
}

macro_rules! errorln {
    ($($arg:tt)*) => {{
        let red = anstyle::Style::new().fg_color(Some(anstyle::AnsiColor::Red.into()));
        eprintln!("{red}Error: {}{red:#}", format_args!($($arg)*));
    }};
}
macro_rules! fatal {
    ($($arg:tt)*) => {{
        errorln!($($arg)*);
        process::exit(1)
    }};
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(
        long,
        default_value = "_new",
        help = "Suffix of db tables containing newly-added features"
    )]
    pub suffix: Vec<String>,
    #[arg(long, help = "Table holding ids of features to delete")]
    pub deletions: Vec<String>,
    #[arg(
        long,
        help = "Existing-feature table checked for linestring intersections"
    )]
    pub existing: Vec<String>,
    #[arg(long, default_value = ".", help = "Directory to write change files to")]
    pub outdir: String,
    #[arg(long, help = "gzip-compress xml output")]
    pub compress: bool,
    #[arg(long, help = "Use negative ids for new OSM elements")]
    pub neg_id: bool,
    #[arg(
        long,
        default_value_t = 0,
        help = "Integer value to start generating ids from"
    )]
    pub id_offset: i64,
    #[arg(
        long,
        help = "Abort when the chosen id offset can collide with existing OSM ids"
    )]
    pub no_collisions: bool,
    #[arg(
        long = "self",
        help = "Also add intersections among newly-added features"
    )]
    pub self_intersections: bool,
    #[arg(
        long,
        default_value = "2000",
        help = "Maximum number of nodes per way, or \"none\""
    )]
    pub max_nodes_per_way: String,
    #[arg(long, help = "hstore column to derive extra tags from")]
    pub hstore_tags: Option<String>,
    #[arg(
        long,
        conflicts_with = "existing",
        help = "Only modify metadata of existing features, never geometry"
    )]
    pub modify_meta: bool,
    #[arg(long, help = "Source OSM pbf file path")]
    pub osmsrc: String,

    #[arg(help = "Database name")]
    pub dbname: Option<String>,
    #[arg(help = "Database port")]
    pub dbport: Option<String>,
    #[arg(help = "Database user")]
    pub dbuser: Option<String>,
    #[arg(help = "Database host")]
    pub dbhost: Option<String>,
    #[arg(help = "Database password")]
    pub dbpass: Option<String>,
}

fn arg_or_env(arg: Option<String>, var: &str, default: &str) -> String {
    arg.or_else(|| env::var(var).ok())
        .unwrap_or_else(|| default.to_string())
}

fn main() {
    let args = Args::parse();

    let max_nodes_per_way = match args.max_nodes_per_way.as_str() {
        "none" => None,
        value => match value.parse::<usize>() {
            Ok(n) => Some(n),
            Err(_) => fatal!(
                "--max_nodes_per_way must be an integer or \"none\", got {value:?}"
            ),
        },
    };

    let password = arg_or_env(args.dbpass.clone(), "PGPASSWORD", "");
    let params = ConnParams {
        dbname: arg_or_env(args.dbname.clone(), "PGDATABASE", "conflate"),
        port: arg_or_env(args.dbport.clone(), "PGPORT", "15432"),
        user: arg_or_env(args.dbuser.clone(), "PGUSER", "postgres"),
        host: arg_or_env(args.dbhost.clone(), "PGHOST", "localhost"),
        password: if password.is_empty() {
            None
        } else {
            Some(password)
        },
    };

    // Probe the source extract for the largest existing id before allocating
    // any new ones.
    match osmpbf::max_ids(&args.osmsrc) {
        Ok(ids) => {
            if args.id_offset <= ids.overall() {
                let text = format!(
                    "chosen id offset {} may collide with existing OSM ids (max id: {})",
                    args.id_offset,
                    ids.overall()
                );
                if args.no_collisions {
                    fatal!("{text}");
                }
                printlnt!("Warning: {text}");
            }
        }
        Err(err) => {
            printlnt!("Warning: could not check existing OSM max ids: {err}");
        }
    }

    let mut tables: Vec<String> = Vec::new();
    {
        let mut source = match PgSource::connect(&params) {
            Ok(source) => source,
            Err(err) => fatal!("could not connect to database: {err}"),
        };
        for suffix in &args.suffix {
            match source.tables_with_suffix(suffix) {
                Ok(found) => tables.extend(found),
                Err(err) => fatal!("could not list tables with suffix {suffix}: {err}"),
            }
        }
    }
    printlnt!("Found tables in db: {tables:?}");

    match fs::create_dir_all(&args.outdir) {
        Err(err) if err.kind() == ErrorKind::AlreadyExists => (),
        Err(err) => fatal!("could not create {}: {err}", args.outdir),
        Ok(()) => (),
    }

    let opts = Options {
        id_offset: args.id_offset,
        neg_id: args.neg_id,
        compress: args.compress,
        self_intersections: args.self_intersections,
        max_nodes_per_way,
        modify_only: args.modify_meta,
        hstore_column: args.hstore_tags.clone(),
        delete_nodes: true,
        member_spelling: MemberSpelling::Long,
    };

    // Tables are independent: one connection, one writer and one change file
    // per table.
    let failures = tables
        .par_iter()
        .map(|table| {
            let suffix = if args.compress { ".osc.gz" } else { ".osc" };
            let outfile = Path::new(&args.outdir).join(format!("{table}{suffix}"));
            let mut source = match PgSource::connect(&params) {
                Ok(source) => source,
                Err(err) => {
                    errorln!("could not connect to database for {table}: {err}");
                    return 1_u32;
                }
            };
            match generator::generate_changes(
                &mut source,
                table,
                &args.existing,
                &args.deletions,
                &args.osmsrc,
                &outfile,
                &opts,
            ) {
                Ok(_) => 0,
                Err(err) => {
                    errorln!("generation failed for {table}: {err}");
                    1
                }
            }
        })
        .sum::<u32>();

    if failures > 0 {
        fatal!("{failures} table(s) failed");
    }
}
