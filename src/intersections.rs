//! Intersection nodes between a new-feature layer and existing layers

use chrono;
use geo::Point;
use rstar::{AABB, RTree, RTreeObject};
use rustc_hash::FxHashSet;
use thiserror;

use crate::db::{IntersectionQuery, SpatialSource};
use crate::idgen::IdAllocator;
use crate::osm::Node;
use crate::osmgeom::Reprojector;

/// Half-size of the envelope each intersection node occupies in the index
const NODE_ENVELOPE: f64 = 0.001;

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
    Db(#[from] crate::db::Error),
    #[error(transparent)]
    Geometry(#[from] crate::osmgeom::Error),
}

/// R-tree entry holding an intersection node under its lookup envelope
#[derive(Clone, Debug)]
struct IndexedNode(Node);

impl RTreeObject for IndexedNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners(
            [self.0.lon - NODE_ENVELOPE, self.0.lat - NODE_ENVELOPE],
            [self.0.lon + NODE_ENVELOPE, self.0.lat + NODE_ENVELOPE],
        )
    }
}

/// Spatial index of the intersection nodes shared between new and existing ways
///
/// Built once per input table, read-only afterwards.
pub struct IntersectionIndex {
    nodes: Vec<Node>,
    rtree: RTree<IndexedNode>,
    intersecting_ids: Vec<Vec<i64>>,
}

impl IntersectionIndex {
    /// Compute intersection nodes between `layer` and every `existing` layer,
    /// optionally including intersections of `layer` with itself.
    pub fn build(
        source: &mut dyn SpatialSource,
        layer: &str,
        existing: &[String],
        ids: &mut IdAllocator,
        self_intersections: bool,
    ) -> Result<IntersectionIndex, Error> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut intersecting_ids = Vec::with_capacity(existing.len());

        for other in existing {
            let mut query = IntersectionQuery::new(layer, other);
            query.want_ids = true;
            let isects = source.intersections(&query)?;
            let reproject = Reprojector::to_wgs84(source.srid(other)?)?;
            nodes_for_points(&isects.points, &reproject, ids, &mut nodes)?;
            intersecting_ids.push(isects.ids);
        }

        if self_intersections {
            let query = IntersectionQuery::new(layer, layer);
            let isects = source.intersections(&query)?;
            let reproject = Reprojector::to_wgs84(source.srid(layer)?)?;
            nodes_for_points(&isects.points, &reproject, ids, &mut nodes)?;
        }

        if !nodes.is_empty() {
            printlnt!("{} intersection nodes found", nodes.len());
        }
        Ok(Self::from_nodes(nodes, intersecting_ids))
    }

    /// Assemble an index from precomputed intersection nodes.
    pub fn from_nodes(nodes: Vec<Node>, intersecting_ids: Vec<Vec<i64>>) -> IntersectionIndex {
        // Self-intersections and cross-layer intersections may land on the
        // same rounded coordinates; the first occurrence wins.
        let mut seen: FxHashSet<(i64, i64)> = FxHashSet::default();
        let mut deduped: Vec<Node> = Vec::with_capacity(nodes.len());
        for node in nodes {
            if seen.insert(node.coord_key()) {
                deduped.push(node);
            } else {
                dprintln!("Duplicate intersection node at ({}, {})", node.lat, node.lon);
            }
        }

        let rtree = RTree::bulk_load(deduped.iter().cloned().map(IndexedNode).collect());

        IntersectionIndex {
            nodes: deduped,
            rtree,
            intersecting_ids,
        }
    }

    /// All intersection nodes, in discovery order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of intersecting existing features, one list per existing layer.
    pub fn intersecting_ids(&self) -> &[Vec<i64>] {
        &self.intersecting_ids
    }

    /// Nodes whose envelope intersects the given bounding box.
    pub fn nodes_in_envelope(
        &self,
        min: (f64, f64),
        max: (f64, f64),
    ) -> impl Iterator<Item = &Node> + '_ {
        self.rtree
            .locate_in_envelope_intersecting(&AABB::from_corners(
                [min.0, min.1],
                [max.0, max.1],
            ))
            .map(|entry| &entry.0)
    }
}

fn nodes_for_points(
    points: &[Point<f64>],
    reproject: &Reprojector,
    ids: &mut IdAllocator,
    nodes: &mut Vec<Node>,
) -> Result<(), Error> {
    for point in points {
        let (lon, lat) = reproject.transform(point.x(), point.y())?;
        nodes.push(Node {
            id: ids.next_id(),
            version: 1,
            lat,
            lon,
            tags: vec![],
        });
    }
    Ok(())
}
