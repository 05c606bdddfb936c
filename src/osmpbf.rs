//! Extraction of existing ways and relations from an OSM pbf extract

use chrono;
use osmpbfreader;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::max;
use std::fs::File;
use std::io;
use std::path::Path;
use thiserror;

use crate::osm::{Member, MemberType, Relation, Tag};

macro_rules! printlnt {
    ($($arg:tt)*) => {
        println!("{} {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), format_args!($($arg)*));
    };
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Pbf(#[from] osmpbfreader::Error),
}

/// Node ids of selected ways, extracted in one streaming scan
///
/// Ids absent from the file are absent from the map; callers detect and log.
pub fn way_node_map(
    filename: &str,
    ids: &FxHashSet<i64>,
) -> Result<FxHashMap<i64, Vec<i64>>, Error> {
    let reader = File::open(Path::new(filename))?;
    let mut pbf = osmpbfreader::OsmPbfReader::new(reader);
    let mut node_map: FxHashMap<i64, Vec<i64>> = FxHashMap::default();

    printlnt!("Scanning {filename} for {} way ids", ids.len());
    for obj in pbf.par_iter() {
        let obj = obj?;
        if let osmpbfreader::OsmObj::Way(way) = obj {
            if ids.contains(&way.id.0) {
                node_map.insert(way.id.0, way.nodes.iter().map(|node| node.0).collect());
            }
        }
    }
    printlnt!("Found {} of {} ways", node_map.len(), ids.len());

    Ok(node_map)
}

/// Selected relations, extracted in one streaming scan
///
/// The pbf reader does not expose element versions, so loaded relations carry
/// version 2, the version their modified copy must be written with.
pub fn relations_by_id(
    filename: &str,
    ids: &FxHashSet<i64>,
) -> Result<FxHashMap<i64, Relation>, Error> {
    let reader = File::open(Path::new(filename))?;
    let mut pbf = osmpbfreader::OsmPbfReader::new(reader);
    let mut relations: FxHashMap<i64, Relation> = FxHashMap::default();

    printlnt!("Scanning {filename} for {} relation ids", ids.len());
    for obj in pbf.par_iter() {
        let obj = obj?;
        if let osmpbfreader::OsmObj::Relation(relation) = obj {
            if !ids.contains(&relation.id.0) {
                continue;
            }
            let mut members: Vec<Member> = Vec::with_capacity(relation.refs.len());
            for r in &relation.refs {
                let (ref_, type_) = match r.member {
                    osmpbfreader::objects::OsmId::Node(id) => (id.0, MemberType::Node),
                    osmpbfreader::objects::OsmId::Way(id) => (id.0, MemberType::Way),
                    osmpbfreader::objects::OsmId::Relation(id) => {
                        (id.0, MemberType::Relation)
                    }
                };
                members.push(Member {
                    ref_,
                    type_,
                    role: r.role.to_string(),
                });
            }
            let mut tags: Vec<Tag> = Vec::new();
            for (k, v) in relation.tags.into_inner() {
                tags.push(Tag::new(&k, &v));
            }
            relations.insert(
                relation.id.0,
                Relation {
                    id: relation.id.0,
                    version: 2,
                    members,
                    tags,
                },
            );
        }
    }
    printlnt!("Found {} of {} relations", relations.len(), ids.len());

    Ok(relations)
}

/// Maximum node/way/relation ids present in an OSM extract
#[derive(Clone, Copy, Debug, Default)]
pub struct MaxIds {
    pub nodes: i64,
    pub ways: i64,
    pub relations: i64,
}

impl MaxIds {
    pub fn overall(&self) -> i64 {
        max(self.nodes, max(self.ways, self.relations))
    }
}

/// Scan an extract for its maximum ids, used by the id-collision check.
pub fn max_ids(filename: &str) -> Result<MaxIds, Error> {
    let reader = File::open(Path::new(filename))?;
    let mut pbf = osmpbfreader::OsmPbfReader::new(reader);
    let mut ids = MaxIds::default();

    printlnt!("Scanning {filename} for maximum ids");
    for obj in pbf.par_iter() {
        match obj? {
            osmpbfreader::OsmObj::Node(node) => ids.nodes = max(ids.nodes, node.id.0),
            osmpbfreader::OsmObj::Way(way) => ids.ways = max(ids.ways, way.id.0),
            osmpbfreader::OsmObj::Relation(relation) => {
                ids.relations = max(ids.relations, relation.id.0);
            }
        }
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_ids_overall() {
        let ids = MaxIds {
            nodes: 11_000_000,
            ways: 7_000_000,
            relations: 15_000,
        };
        assert_eq!(ids.overall(), 11_000_000);
        assert_eq!(MaxIds::default().overall(), 0);
    }
}
