//! Access to the PostGIS database holding new/modified/deleted features

use chrono;
use geo::Point;
use postgres::fallible_iterator::FallibleIterator;
use postgres::{Client, NoTls};
use std::error;
use thiserror;

use crate::osmgeom;

/// Name of the geometry column expected on feature tables
pub const GEOMETRY_COLUMN: &str = "geometry";
/// Name of the id column carrying OSM ids
pub const ID_COLUMN: &str = "osm_id";
/// Default search distance for the intersection queries, in projected CRS units
pub const DEFAULT_DISTANCE_BUFFER: f64 = 5.0;

macro_rules! printlnt {
    ($($arg:tt)*) => {
        println!("{} {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), format_args!($($arg)*));
    };
}
macro_rules! dprintln {
    ($($arg:tt)*) => (#[cfg(debug_assertions)] println!($($arg)*));
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Postgres(#[from] postgres::Error),
    #[error(transparent)]
    Geometry(#[from] osmgeom::Error),
    #[error("layer {0} not found")]
    LayerNotFound(String),
    #[error("invalid hstore literal: {0}")]
    Hstore(String),
}

/// One feature handle: geometry as WKT plus stringified attribute values
#[derive(Clone, Debug, Default)]
pub struct Feature {
    /// Ordinal of the feature within its stream, for diagnostics
    pub fid: i64,
    /// Geometry as WKT, in the layer's native CRS
    pub geometry_wkt: Option<String>,
    /// Attribute values by column name, in column order; NULL becomes ""
    pub fields: Vec<(String, String)>,
}

impl Feature {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Parameters of one intersection query between a new layer and an existing one
#[derive(Clone, Debug)]
pub struct IntersectionQuery<'a> {
    pub new_layer: &'a str,
    pub existing_layer: &'a str,
    pub new_geometry_field: &'a str,
    pub existing_geometry_field: &'a str,
    pub id_field: &'a str,
    pub want_ids: bool,
    pub distance_buffer: f64,
}

impl<'a> IntersectionQuery<'a> {
    pub fn new(new_layer: &'a str, existing_layer: &'a str) -> IntersectionQuery<'a> {
        IntersectionQuery {
            new_layer,
            existing_layer,
            new_geometry_field: GEOMETRY_COLUMN,
            existing_geometry_field: GEOMETRY_COLUMN,
            id_field: ID_COLUMN,
            want_ids: false,
            distance_buffer: DEFAULT_DISTANCE_BUFFER,
        }
    }
}

/// Result of an intersection query
#[derive(Clone, Debug, Default)]
pub struct Intersections {
    /// Closest points between feature pairs, in the layers' native CRS
    pub points: Vec<Point<f64>>,
    /// Distinct ids of intersecting existing features; empty unless requested
    pub ids: Vec<i64>,
}

/// Source of spatial features, field lists and intersection computations
///
/// The production implementation is [`PgSource`]; tests substitute their own.
pub trait SpatialSource {
    /// Names of the available spatial layers.
    fn layers(&mut self) -> Result<Vec<String>, Error>;
    /// Attribute column names of `layer`, geometry columns excluded.
    fn fields(&mut self, layer: &str) -> Result<Vec<String>, Error>;
    /// EPSG code of the layer's geometry column.
    fn srid(&mut self, layer: &str) -> Result<u32, Error>;
    /// Number of features in `layer`.
    fn count(&mut self, layer: &str) -> Result<u64, Error>;
    /// Stream every feature of `layer` through `op`, one at a time.
    fn for_each_feature(
        &mut self,
        layer: &str,
        op: &mut dyn FnMut(Feature) -> Result<(), Box<dyn error::Error>>,
    ) -> Result<(), Box<dyn error::Error>>;
    /// Single feature whose `id_field` equals `id`; warns on multiple matches.
    fn find(&mut self, layer: &str, id: i64, id_field: &str)
    -> Result<Option<Feature>, Error>;
    /// Distinct non-null values of `field` across `layer`.
    fn ids(&mut self, layer: &str, field: &str) -> Result<Vec<i64>, Error>;
    /// Closest points between close feature pairs of two layers.
    fn intersections(&mut self, query: &IntersectionQuery) -> Result<Intersections, Error>;
}

/// Database connection parameters
#[derive(Clone, Debug)]
pub struct ConnParams {
    pub dbname: String,
    pub port: String,
    pub user: String,
    pub host: String,
    pub password: Option<String>,
}

/// [`SpatialSource`] backed by a PostGIS connection
pub struct PgSource {
    client: Client,
}

impl PgSource {
    pub fn connect(params: &ConnParams) -> Result<PgSource, Error> {
        let mut conn = format!(
            "host={} port={} user={} dbname={}",
            params.host, params.port, params.user, params.dbname
        );
        if let Some(password) = &params.password {
            conn.push_str(&format!(" password={password}"));
        }
        dprintln!("Opening PostGIS connection: {conn}");
        let client = Client::connect(&conn, NoTls)?;
        Ok(PgSource { client })
    }

    /// Table names matching `suffix`, from information_schema.
    pub fn tables_with_suffix(&mut self, suffix: &str) -> Result<Vec<String>, Error> {
        let pattern = format!("%{suffix}");
        let rows = self.client.query(
            "SELECT table_name FROM information_schema.tables WHERE table_name LIKE $1",
            &[&pattern],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn feature_from_row(row: &postgres::Row, fields: &[String], fid: i64) -> Feature {
        let geometry_wkt: Option<String> = row.get(0);
        let values = fields
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let value: Option<String> = row.get(idx + 1);
                (name.clone(), value.unwrap_or_default())
            })
            .collect();
        Feature {
            fid,
            geometry_wkt,
            fields: values,
        }
    }
}

impl SpatialSource for PgSource {
    fn layers(&mut self) -> Result<Vec<String>, Error> {
        let rows = self
            .client
            .query("SELECT f_table_name FROM geometry_columns", &[])?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn fields(&mut self, layer: &str) -> Result<Vec<String>, Error> {
        let rows = self.client.query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_name = $1 AND udt_name NOT IN ('geometry', 'geography') \
             ORDER BY ordinal_position",
            &[&layer],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn srid(&mut self, layer: &str) -> Result<u32, Error> {
        let rows = self.client.query(
            "SELECT srid FROM geometry_columns WHERE f_table_name = $1",
            &[&layer],
        )?;
        let row = rows
            .first()
            .ok_or_else(|| Error::LayerNotFound(layer.to_string()))?;
        let srid: i32 = row.get(0);
        Ok(srid.unsigned_abs())
    }

    fn count(&mut self, layer: &str) -> Result<u64, Error> {
        let rows = self
            .client
            .query(format!("SELECT count(*) FROM {layer}").as_str(), &[])?;
        let count: i64 = rows
            .first()
            .ok_or_else(|| Error::LayerNotFound(layer.to_string()))?
            .get(0);
        Ok(count.unsigned_abs())
    }

    fn for_each_feature(
        &mut self,
        layer: &str,
        op: &mut dyn FnMut(Feature) -> Result<(), Box<dyn error::Error>>,
    ) -> Result<(), Box<dyn error::Error>> {
        let fields = self.fields(layer)?;
        let sql = feature_select_sql(layer, &fields, None);
        dprintln!("Executing SQL: {sql}");
        let mut rows = self
            .client
            .query_raw(sql.as_str(), std::iter::empty::<&str>())
            .map_err(Error::from)?;
        let mut fid = 0;
        while let Some(row) = rows.next().map_err(Error::from)? {
            op(Self::feature_from_row(&row, &fields, fid))?;
            fid += 1;
        }
        Ok(())
    }

    fn find(
        &mut self,
        layer: &str,
        id: i64,
        id_field: &str,
    ) -> Result<Option<Feature>, Error> {
        let fields = self.fields(layer)?;
        let sql = feature_select_sql(layer, &fields, Some((id_field, id)));
        dprintln!("Executing SQL: {sql}");
        let rows = self.client.query(sql.as_str(), &[])?;
        if rows.len() > 1 {
            printlnt!("Warning: more than one match for {id_field}={id} (layer: {layer})");
        }
        Ok(rows
            .first()
            .map(|row| Self::feature_from_row(row, &fields, 0)))
    }

    fn ids(&mut self, layer: &str, field: &str) -> Result<Vec<i64>, Error> {
        let sql = format!(
            "SELECT DISTINCT {field}::text FROM {layer} WHERE {field} IS NOT NULL"
        );
        dprintln!("Executing SQL: {sql}");
        let rows = self.client.query(sql.as_str(), &[])?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let value: String = row.get(0);
            match value.trim().parse() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    printlnt!("Warning: {field} value {value:?} in {layer} is not an id");
                }
            }
        }
        Ok(ids)
    }

    fn intersections(&mut self, query: &IntersectionQuery) -> Result<Intersections, Error> {
        let sql = intersection_points_sql(query);
        dprintln!("Executing SQL: {sql}");
        let rows = self.client.query(sql.as_str(), &[])?;
        let mut points = Vec::with_capacity(rows.len());
        for row in &rows {
            let wkt: Option<String> = row.get(0);
            let Some(wkt) = wkt else { continue };
            match osmgeom::parse_wkt(&wkt)? {
                geo::Geometry::Point(point) => points.push(point),
                geom => {
                    printlnt!("Warning: intersection query returned a non-point: {geom:?}");
                }
            }
        }

        let mut ids = Vec::new();
        if query.want_ids {
            let sql = intersecting_ids_sql(query);
            dprintln!("Executing SQL: {sql}");
            let rows = self.client.query(sql.as_str(), &[])?;
            for row in &rows {
                let value: String = row.get(0);
                match value.trim().parse() {
                    Ok(id) => ids.push(id),
                    Err(_) => {
                        printlnt!(
                            "Warning: {} value {value:?} in {} is not an id",
                            query.id_field,
                            query.existing_layer
                        );
                    }
                }
            }
        }

        Ok(Intersections { points, ids })
    }
}

/// SELECT returning the WKT geometry followed by every attribute column as text
fn feature_select_sql(layer: &str, fields: &[String], by_id: Option<(&str, i64)>) -> String {
    let mut columns = vec![format!("ST_AsText({GEOMETRY_COLUMN})")];
    columns.extend(fields.iter().map(|field| format!("{field}::text")));
    let mut sql = format!("SELECT {} FROM {layer}", columns.join(", "));
    if let Some((id_field, id)) = by_id {
        sql.push_str(&format!(" WHERE {id_field} = {id}"));
    }
    sql
}

/// Closest points between all feature pairs closer than the distance buffer
fn intersection_points_sql(query: &IntersectionQuery) -> String {
    format!(
        "SELECT DISTINCT ST_AsText(intersection) FROM ( \
         SELECT ST_ClosestPoint(n.{new_geom}, o.{exist_geom}) AS intersection, \
         n.{new_geom} AS ngeom \
         FROM {new_layer} AS n \
         RIGHT JOIN {existing_layer} AS o \
         ON NOT ST_Equals(n.{new_geom}, o.{exist_geom}) \
         AND ST_DWithin(n.{new_geom}, o.{exist_geom}, {buffer:.9}) \
         ) isects WHERE isects.ngeom IS NOT NULL",
        new_geom = query.new_geometry_field,
        exist_geom = query.existing_geometry_field,
        new_layer = query.new_layer,
        existing_layer = query.existing_layer,
        buffer = query.distance_buffer,
    )
}

/// Distinct ids of existing features participating in an intersection
fn intersecting_ids_sql(query: &IntersectionQuery) -> String {
    format!(
        "SELECT DISTINCT o.{id_field} FROM {existing_layer} o \
         INNER JOIN {new_layer} n \
         ON ST_DWithin(n.{new_geom}, o.{exist_geom}, {buffer:.5})",
        id_field = query.id_field,
        existing_layer = query.existing_layer,
        new_layer = query.new_layer,
        new_geom = query.new_geometry_field,
        exist_geom = query.existing_geometry_field,
        buffer = query.distance_buffer,
    )
}

/// Parse a Postgres hstore literal (`"k"=>"v", …`) into key/value pairs
///
/// Unquoted values (NULL) are kept verbatim.
pub fn hstore_entries(hstore: &str) -> Result<Vec<(String, String)>, Error> {
    fn quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<String> {
        let mut out = String::new();
        loop {
            match chars.next()? {
                '\\' => out.push(chars.next()?),
                '"' => return Some(out),
                c => out.push(c),
            }
        }
    }
    fn bare(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
        let mut out = String::new();
        while let Some(&c) = chars.peek() {
            if c == ',' {
                break;
            }
            out.push(c);
            chars.next();
        }
        out.trim_end().to_string()
    }

    let mut entries = Vec::new();
    let mut chars = hstore.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(&c) = chars.peek() else { break };
        if c != '"' {
            return Err(Error::Hstore(hstore.to_string()));
        }
        chars.next();
        let key = quoted(&mut chars).ok_or_else(|| Error::Hstore(hstore.to_string()))?;
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') || chars.next() != Some('>') {
            return Err(Error::Hstore(hstore.to_string()));
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let value = match chars.peek() {
            Some('"') => {
                chars.next();
                quoted(&mut chars).ok_or_else(|| Error::Hstore(hstore.to_string()))?
            }
            Some(_) => bare(&mut chars),
            None => return Err(Error::Hstore(hstore.to_string())),
        };
        entries.push((key, value));
    }
    Ok(entries)
}
