//! Compilation of database features into OSM primitives and change files

use chrono;
use geo::{BoundingRect, Coord, EuclideanDistance, Geometry, LineString, Point};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json;
use std::error;
use std::path::Path;
use thiserror;

use crate::db::{Feature, ID_COLUMN, SpatialSource, hstore_entries};
use crate::idgen::IdAllocator;
use crate::intersections::IntersectionIndex;
use crate::osm::{
    self, Member, MemberSpelling, MemberType, Node, OsmElement, Relation, Tag, Way,
};
use crate::osmchange::OsmChangeWriter;
use crate::osmgeom::{self, Reprojector, point_insertion_index};
use crate::osmpbf;
use crate::relations::{MEMBER_OF_PREFIX, RelationUpdater};

/// Version written on newly-created primitives
const NEW_VERSION: i32 = 1;
/// Version written on primitives replacing an existing id
const MODIFIED_VERSION: i32 = 2;
/// Placeholder version on deletion records whose true version is unknown
const DELETED_VERSION: i32 = 99;
/// Vertex count of each sub-way produced when splitting an over-long way
const WAY_CHUNK_LEN: usize = 500;
/// Default cap on the number of nodes per way
pub const DEFAULT_MAX_NODES_PER_WAY: usize = 2000;
/// Warn when an existing way's geometry holds more points than this
const WAY_POINT_THRESHOLD: usize = 1500;
/// Half-size of the bbox used to look up reusable nodes around a vertex
const VERTEX_LOOKUP_ENVELOPE: f64 = 0.001;
/// Maximum distance at which a vertex reuses an intersection node
const VERTEX_REUSE_DISTANCE: f64 = 0.0001;
/// Expansion of an existing way's bbox when collecting intersection nodes
const EXISTING_WAY_ENVELOPE: f64 = 0.01;
/// Buffer around an intersection node for the on-way membership test
const ON_WAY_BUFFER: f64 = 0.00005;

macro_rules! printlnt {
    ($($arg:tt)*) => {
        println!("{} {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), format_args!($($arg)*));
    };
}
macro_rules! dprintln {
    ($($arg:tt)*) => (#[cfg(debug_assertions)] println!($($arg)*));
}

/// Error aborting a whole feature, logged by the orchestrator which then
/// continues with the next one
#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("multi geometries are not supported")]
    MultiGeometry,
    #[error("feature has no geometry")]
    NoGeometry,
    #[error("geometry type {0} is not supported")]
    UnsupportedGeometry(&'static str),
    #[error("feature has no usable osm_id value")]
    MissingOsmId,
    #[error("way {0} not found in the OSM source")]
    WayNotFound(i64),
    #[error(transparent)]
    Geometry(#[from] osmgeom::Error),
}

/// Options of one generation run
#[derive(Clone, Debug)]
pub struct Options {
    pub id_offset: i64,
    pub neg_id: bool,
    pub compress: bool,
    pub self_intersections: bool,
    /// `None` removes the cap entirely
    pub max_nodes_per_way: Option<usize>,
    /// Rewrite metadata of existing primitives instead of creating new ones
    pub modify_only: bool,
    pub hstore_column: Option<String>,
    /// Also delete the constituent nodes of deleted ways
    pub delete_nodes: bool,
    pub member_spelling: MemberSpelling,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            id_offset: 0,
            neg_id: false,
            compress: false,
            self_intersections: false,
            max_nodes_per_way: Some(DEFAULT_MAX_NODES_PER_WAY),
            modify_only: false,
            hstore_column: None,
            delete_nodes: true,
            member_spelling: MemberSpelling::default(),
        }
    }
}

/// Summary counters of one generated change file
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RunStats {
    pub features: u64,
    pub skipped: u64,
    pub created_nodes: u64,
    pub created_ways: u64,
    pub created_relations: u64,
    pub modified_nodes: u64,
    pub modified_ways: u64,
    pub modified_relations: u64,
    pub deleted: u64,
}

/// Primitives produced for one feature
#[derive(Debug, Default)]
pub struct CompiledFeature {
    pub nodes: Vec<Node>,
    pub ways: Vec<Way>,
    pub relations: Vec<Relation>,
}

/// State shared while compiling the features of one table
struct TableContext<'a> {
    fields: Vec<String>,
    reproject: Reprojector,
    index: &'a IntersectionIndex,
    /// Modify-only: node lists of the existing ways being rewritten
    way_nodes: FxHashMap<i64, Vec<i64>>,
    opts: &'a Options,
}

/// Tags from a feature's attribute columns plus its optional hstore column
///
/// Columns win over hstore keys on duplicates; the hstore column itself and
/// every name in `exclude` contribute nothing. An unparsable hstore value is
/// logged and contributes no tags.
pub fn generate_tags(
    feature: &Feature,
    fields: &[String],
    hstore_column: Option<&str>,
    exclude: &[&str],
) -> Vec<Tag> {
    let mut tags = Vec::new();
    for field in fields {
        if exclude.contains(&field.as_str()) || hstore_column == Some(field.as_str()) {
            continue;
        }
        tags.push(Tag::new(field, feature.field(field).unwrap_or_default()));
    }

    if let Some(column) = hstore_column {
        let known: FxHashSet<&str> = fields.iter().map(String::as_str).collect();
        match hstore_entries(feature.field(column).unwrap_or_default()) {
            Ok(entries) => {
                for (key, value) in entries {
                    if !known.contains(key.as_str()) {
                        tags.push(Tag { key, value });
                    }
                }
            }
            Err(err) => {
                printlnt!(
                    "Error parsing hstore column {column} for feature {}: {err}",
                    feature.fid
                );
            }
        }
    }
    tags
}

/// Split a node-id list into ways respecting `node_limit`
///
/// A list within the limit becomes a single way, closed by repeating the
/// first id when `closed`. A longer list is chunked; every chunk after the
/// first is prepended with the previous chunk's final id, so consecutive
/// sub-ways share exactly one joiner node. Closure is not applied to split
/// ways.
pub fn make_ways(
    mut nds: Vec<i64>,
    tags: Vec<Tag>,
    ids: &mut IdAllocator,
    node_limit: Option<usize>,
    closed: bool,
) -> Vec<Way> {
    let mut ways = Vec::new();
    if node_limit.is_none_or(|limit| nds.len() <= limit) {
        if closed && !nds.is_empty() {
            nds.push(nds[0]);
        }
        ways.push(Way {
            id: ids.next_id(),
            version: NEW_VERSION,
            nds,
            tags,
        });
    } else {
        let limit = node_limit.unwrap_or(DEFAULT_MAX_NODES_PER_WAY);
        let chunk_len = WAY_CHUNK_LEN.min(limit.saturating_sub(1)).max(1);
        let mut joiner: Option<i64> = None;
        for chunk in nds.chunks(chunk_len) {
            let mut chunk_nds: Vec<i64> = Vec::with_capacity(chunk.len() + 1);
            if let Some(joiner) = joiner {
                chunk_nds.push(joiner);
            }
            chunk_nds.extend_from_slice(chunk);
            joiner = chunk_nds.last().copied();
            ways.push(Way {
                id: ids.next_id(),
                version: NEW_VERSION,
                nds: chunk_nds,
                tags: tags.clone(),
            });
        }
    }
    ways
}

/// Ways and fresh nodes for one linestring, sharing intersection nodes
///
/// A vertex lying within reach of an intersection node reuses that node's id
/// instead of allocating a new one. Intersection nodes lying on the line but
/// absent from the vertex list are inserted at their geometric position, or
/// replace a vertex whose rounded coordinates coincide. The id list and the
/// coordinate list are maintained in parallel so every index stays aligned.
pub fn generate_ways_and_nodes(
    line: &LineString<f64>,
    ids: &mut IdAllocator,
    tags: Vec<Tag>,
    index: &IntersectionIndex,
    node_limit: Option<usize>,
    closed: bool,
) -> Result<(Vec<Way>, Vec<Node>), FeatureError> {
    let mut coords: Vec<Coord<f64>> = line.0.clone();
    if closed && coords.len() > 1 && coords.first() == coords.last() {
        // ring closure is expressed by repeating the first id, not by a
        // second node on the same position
        coords.pop();
    }

    let mut new_nodes: Vec<Node> = Vec::new();
    let mut way_node_ids: Vec<i64> = Vec::with_capacity(coords.len());
    let mut way_coords: Vec<Coord<f64>> = Vec::with_capacity(coords.len());

    for coord in &coords {
        let vertex = Point::new(coord.x, coord.y);
        let mut reusable: Vec<(&Node, f64)> = index
            .nodes_in_envelope(
                (
                    coord.x - VERTEX_LOOKUP_ENVELOPE,
                    coord.y - VERTEX_LOOKUP_ENVELOPE,
                ),
                (
                    coord.x + VERTEX_LOOKUP_ENVELOPE,
                    coord.y + VERTEX_LOOKUP_ENVELOPE,
                ),
            )
            .map(|node| {
                let distance = vertex.euclidean_distance(&Point::new(node.lon, node.lat));
                (node, distance)
            })
            .filter(|(_, distance)| *distance < VERTEX_REUSE_DISTANCE)
            .collect();
        reusable.sort_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((node, _)) = reusable.first() {
            way_node_ids.push(node.id);
            way_coords.push(Coord {
                x: node.lon,
                y: node.lat,
            });
        } else {
            let id = ids.next_id();
            way_node_ids.push(id);
            way_coords.push(*coord);
            new_nodes.push(Node {
                id,
                version: NEW_VERSION,
                lat: coord.y,
                lon: coord.x,
                tags: vec![],
            });
        }
    }

    // intersection nodes on the line that are not yet referenced by it
    let Some(bbox) = line.bounding_rect() else {
        return Err(FeatureError::NoGeometry);
    };
    let line_geos = osmgeom::to_geos(&Geometry::LineString(line.clone()))?;
    let mut add_nodes: Vec<Node> = Vec::new();
    for node in index.nodes_in_envelope((bbox.min().x, bbox.min().y), (bbox.max().x, bbox.max().y))
    {
        if way_node_ids.contains(&node.id) {
            continue;
        }
        if osmgeom::point_intersects(&line_geos, node.lon, node.lat)? {
            add_nodes.push(node.clone());
        }
    }

    for node in add_nodes {
        if way_coords.len() < 2 {
            printlnt!("Warning: malformed linestring found");
            continue;
        }
        let assembled = LineString::new(way_coords.clone());
        let idx = point_insertion_index(&assembled, &Point::new(node.lon, node.lat));
        let at = way_coords[idx];
        if osm::coord_key(node.lat) == osm::coord_key(at.y)
            && osm::coord_key(node.lon) == osm::coord_key(at.x)
        {
            // the intersection coincides with a vertex; reference the shared
            // node there to keep the two ways connected
            dprintln!("Intersection node {} replaces vertex {idx}", node.id);
            let replaced = way_node_ids[idx];
            way_node_ids[idx] = node.id;
            way_coords[idx] = Coord {
                x: node.lon,
                y: node.lat,
            };
            new_nodes.retain(|n| n.id != replaced);
        } else {
            way_node_ids.insert(idx, node.id);
            way_coords.insert(
                idx,
                Coord {
                    x: node.lon,
                    y: node.lat,
                },
            );
        }
    }

    Ok((make_ways(way_node_ids, tags, ids, node_limit, closed), new_nodes))
}

/// Rewrite an existing way's node list to include the intersection nodes
/// lying on its geometry
pub fn modify_existing_way(
    way_geom: &LineString<f64>,
    way_id: i64,
    node_ids: &[i64],
    tags: Vec<Tag>,
    index: &IntersectionIndex,
) -> Result<Way, FeatureError> {
    let mut nds: Vec<i64> = node_ids.to_vec();
    let mut coords: Vec<Coord<f64>> = way_geom.0.clone();
    if coords.len() > WAY_POINT_THRESHOLD {
        printlnt!(
            "Warning: way {way_id} has {} points, above the threshold ({WAY_POINT_THRESHOLD})",
            coords.len()
        );
    }

    let Some(bbox) = way_geom.bounding_rect() else {
        return Err(FeatureError::NoGeometry);
    };
    let way_geos = osmgeom::to_geos(&Geometry::LineString(way_geom.clone()))?;
    let mut add_nodes: Vec<Node> = Vec::new();
    for node in index.nodes_in_envelope(
        (
            bbox.min().x - EXISTING_WAY_ENVELOPE,
            bbox.min().y - EXISTING_WAY_ENVELOPE,
        ),
        (
            bbox.max().x + EXISTING_WAY_ENVELOPE,
            bbox.max().y + EXISTING_WAY_ENVELOPE,
        ),
    ) {
        if osmgeom::buffered_point_intersects(&way_geos, node.lon, node.lat, ON_WAY_BUFFER)? {
            add_nodes.push(node.clone());
        }
    }

    for node in add_nodes {
        if coords.len() < 2 {
            printlnt!("Warning: malformed linestring found");
            continue;
        }
        let line = LineString::new(coords.clone());
        let idx = point_insertion_index(&line, &Point::new(node.lon, node.lat));
        let at = coords[idx];
        if osm::coord_key(node.lat) == osm::coord_key(at.y)
            && osm::coord_key(node.lon) == osm::coord_key(at.x)
        {
            // the intersection point already exists on the way, e.g. two
            // features meeting exactly at an endpoint; replace the node
            // reference to keep connectivity
            if idx < nds.len() {
                nds.remove(idx);
            } else {
                printlnt!(
                    "Warning: out of bounds in node removal, does the intersection index contain duplicates?"
                );
            }
            coords.remove(idx);
            nds.insert(idx.min(nds.len()), node.id);
            coords.insert(
                idx,
                Coord {
                    x: node.lon,
                    y: node.lat,
                },
            );
        } else {
            nds.insert(idx.min(nds.len()), node.id);
            coords.insert(
                idx,
                Coord {
                    x: node.lon,
                    y: node.lat,
                },
            );
        }
    }

    Ok(Way {
        id: way_id,
        version: MODIFIED_VERSION,
        nds,
        tags,
    })
}

fn geometry_name(geom: &Geometry<f64>) -> &'static str {
    match geom {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

fn strip_osm_id(tags: Vec<Tag>) -> Vec<Tag> {
    tags.into_iter().filter(|tag| tag.key != ID_COLUMN).collect()
}

fn feature_osm_id(feature: &Feature) -> Result<i64, FeatureError> {
    feature
        .field(ID_COLUMN)
        .and_then(|value| value.trim().parse().ok())
        .ok_or(FeatureError::MissingOsmId)
}

/// Relation holding every way of a split ring under a single role
fn relation_for_ways(
    ways: &[Way],
    ids: &mut IdAllocator,
    tags: Vec<Tag>,
    role: &str,
) -> Relation {
    dprintln!("Creating relation with {} members", ways.len());
    Relation {
        id: ids.next_id(),
        version: NEW_VERSION,
        members: ways
            .iter()
            .map(|way| Member {
                ref_: way.id,
                type_: MemberType::Way,
                role: role.to_string(),
            })
            .collect(),
        tags,
    }
}

/// Compile one feature into the primitives representing it
fn compile_feature(
    feature: &Feature,
    ctx: &TableContext<'_>,
    ids: &mut IdAllocator,
) -> Result<CompiledFeature, FeatureError> {
    let wkt = feature
        .geometry_wkt
        .as_deref()
        .ok_or(FeatureError::NoGeometry)?;
    let geom = osmgeom::parse_wkt(wkt)?;
    let geom = ctx.reproject.transform_geometry(&geom)?;
    let tags = generate_tags(
        feature,
        &ctx.fields,
        ctx.opts.hstore_column.as_deref(),
        &[],
    );

    let mut out = CompiledFeature::default();
    match &geom {
        Geometry::MultiLineString(_) | Geometry::MultiPolygon(_) => {
            return Err(FeatureError::MultiGeometry);
        }
        Geometry::Point(point) => {
            if ctx.opts.modify_only {
                let id = feature_osm_id(feature)?;
                out.nodes.push(Node {
                    id,
                    version: MODIFIED_VERSION,
                    lat: point.y(),
                    lon: point.x(),
                    tags: strip_osm_id(tags),
                });
            } else {
                out.nodes.push(Node {
                    id: ids.next_id(),
                    version: NEW_VERSION,
                    lat: point.y(),
                    lon: point.x(),
                    tags,
                });
            }
        }
        Geometry::LineString(line) => {
            if ctx.opts.modify_only {
                out.ways.push(modify_only_way(feature, ctx, tags)?);
            } else {
                let (ways, nodes) = generate_ways_and_nodes(
                    line,
                    ids,
                    tags,
                    ctx.index,
                    ctx.opts.max_nodes_per_way,
                    false,
                )?;
                out.ways.extend(ways);
                out.nodes.extend(nodes);
            }
        }
        Geometry::Polygon(polygon) => {
            if ctx.opts.modify_only {
                out.ways.push(modify_only_way(feature, ctx, tags)?);
            } else if polygon.interiors().is_empty() {
                // a simple ring is just a closed way
                let (ways, nodes) = generate_ways_and_nodes(
                    polygon.exterior(),
                    ids,
                    tags,
                    ctx.index,
                    ctx.opts.max_nodes_per_way,
                    true,
                )?;
                out.nodes.extend(nodes);
                if ways.len() > 1 {
                    // the ring was longer than the node limit and got split;
                    // a relation holds the pieces together
                    let mut relation_tags = ways[0].tags.clone();
                    relation_tags.push(Tag::new("type", "multipolygon"));
                    out.relations
                        .push(relation_for_ways(&ways, ids, relation_tags, "outer"));
                }
                out.ways.extend(ways);
            } else {
                // polygons with holes become multipolygon relations of
                // tagless ways
                let (outer_ways, outer_nodes) = generate_ways_and_nodes(
                    polygon.exterior(),
                    ids,
                    vec![],
                    ctx.index,
                    ctx.opts.max_nodes_per_way,
                    true,
                )?;
                let mut inner_ways: Vec<Way> = Vec::new();
                let mut inner_nodes: Vec<Node> = Vec::new();
                for hole in polygon.interiors() {
                    let (ways, nodes) = generate_ways_and_nodes(
                        hole,
                        ids,
                        vec![],
                        ctx.index,
                        ctx.opts.max_nodes_per_way,
                        true,
                    )?;
                    inner_ways.extend(ways);
                    inner_nodes.extend(nodes);
                }

                let mut members: Vec<Member> = outer_ways
                    .iter()
                    .map(|way| Member {
                        ref_: way.id,
                        type_: MemberType::Way,
                        role: String::from("outer"),
                    })
                    .collect();
                members.extend(inner_ways.iter().map(|way| Member {
                    ref_: way.id,
                    type_: MemberType::Way,
                    role: String::from("inner"),
                }));
                let mut relation_tags = tags;
                relation_tags.push(Tag::new("type", "multipolygon"));
                out.relations.push(Relation {
                    id: ids.next_id(),
                    version: NEW_VERSION,
                    members,
                    tags: relation_tags,
                });
                out.ways.extend(outer_ways);
                out.ways.extend(inner_ways);
                out.nodes.extend(outer_nodes);
                out.nodes.extend(inner_nodes);
            }
        }
        geom => return Err(FeatureError::UnsupportedGeometry(geometry_name(geom))),
    }
    Ok(out)
}

/// Modify-only rendition of a linestring or polygon feature: same id, the
/// node list read from the OSM source, version 2, osm_id tag stripped
fn modify_only_way(
    feature: &Feature,
    ctx: &TableContext<'_>,
    tags: Vec<Tag>,
) -> Result<Way, FeatureError> {
    let id = feature_osm_id(feature)?;
    let nds = ctx
        .way_nodes
        .get(&id)
        .ok_or(FeatureError::WayNotFound(id))?
        .clone();
    Ok(Way {
        id,
        version: MODIFIED_VERSION,
        nds,
        tags: strip_osm_id(tags),
    })
}

/// Deletion records for `way_ids`: per way its constituent node ids (once
/// each across the whole batch, version 99, placeholder coordinates) followed
/// by the way itself
fn deletion_elements(
    way_ids: &[i64],
    way_node_map: &FxHashMap<i64, Vec<i64>>,
    delete_nodes: bool,
) -> Vec<OsmElement> {
    let mut elements: Vec<OsmElement> = Vec::new();
    let mut known_nodes: FxHashSet<i64> = FxHashSet::default();
    for &way_id in way_ids {
        if delete_nodes {
            match way_node_map.get(&way_id) {
                Some(node_ids) => {
                    for &node_id in node_ids {
                        if known_nodes.insert(node_id) {
                            elements.push(
                                Node {
                                    id: node_id,
                                    version: DELETED_VERSION,
                                    lat: 0.0,
                                    lon: 0.0,
                                    tags: vec![],
                                }
                                .into(),
                            );
                        } else {
                            dprintln!("Skipping node {node_id}, already deleted");
                        }
                    }
                }
                None => {
                    printlnt!(
                        "Warning: way {way_id} not found in the OSM source, deleting the way only"
                    );
                }
            }
        }
        elements.push(
            Way {
                id: way_id,
                version: DELETED_VERSION,
                nds: vec![],
                tags: vec![],
            }
            .into(),
        );
    }
    elements
}

fn write_compiled(
    writer: &mut OsmChangeWriter,
    compiled: CompiledFeature,
    modify_only: bool,
    stats: &mut RunStats,
    pending_members: &mut Vec<OsmElement>,
) -> Result<(), crate::osmchange::Error> {
    let mut elements: Vec<OsmElement> = Vec::new();
    elements.extend(compiled.nodes.into_iter().map(OsmElement::from));
    elements.extend(compiled.ways.into_iter().map(OsmElement::from));
    let relations: Vec<OsmElement> = compiled
        .relations
        .into_iter()
        .map(OsmElement::from)
        .collect();

    for element in elements.iter().chain(relations.iter()) {
        match (element, modify_only) {
            (OsmElement::Node(_), false) => stats.created_nodes += 1,
            (OsmElement::Way(_), false) => stats.created_ways += 1,
            (OsmElement::Relation(_), false) => stats.created_relations += 1,
            (OsmElement::Node(_), true) => stats.modified_nodes += 1,
            (OsmElement::Way(_), true) => stats.modified_ways += 1,
            (OsmElement::Relation(_), true) => stats.modified_relations += 1,
        }
        if element
            .tags()
            .iter()
            .any(|tag| tag.key.starts_with(MEMBER_OF_PREFIX))
        {
            pending_members.push(element.clone());
        }
    }

    if modify_only {
        if !elements.is_empty() {
            writer.add_modify(&elements)?;
        }
        if !relations.is_empty() {
            writer.add_modify(&relations)?;
        }
    } else {
        if !elements.is_empty() {
            writer.add_create(&elements)?;
        }
        if !relations.is_empty() {
            writer.add_create(&relations)?;
        }
    }
    Ok(())
}

/// Generate one OSMChange file for `table`
///
/// Streams every feature of the table through the compiler, rewrites
/// intersecting existing ways, updates membership-tagged relations, emits the
/// shared intersection nodes and the deletion batch, and closes the document.
#[allow(clippy::too_many_lines)]
pub fn generate_changes(
    source: &mut dyn SpatialSource,
    table: &str,
    existing: &[String],
    deletions: &[String],
    osmsrc: &str,
    outfile: &Path,
    opts: &Options,
) -> Result<RunStats, Box<dyn error::Error>> {
    let mut ids = IdAllocator::new(opts.id_offset, opts.neg_id);
    let mut writer = OsmChangeWriter::create(outfile, opts.compress, opts.member_spelling)?;
    let mut stats = RunStats::default();

    let index =
        IntersectionIndex::build(source, table, existing, &mut ids, opts.self_intersections)?;

    let fields = source.fields(table)?;
    let reproject = Reprojector::to_wgs84(source.srid(table)?)?;
    let n_features = source.count(table)?;

    // modify-only runs keep existing geometry; the node lists come from the
    // OSM source
    let way_nodes = if opts.modify_only {
        let id_set: FxHashSet<i64> = source.ids(table, ID_COLUMN)?.into_iter().collect();
        osmpbf::way_node_map(osmsrc, &id_set)?
    } else {
        FxHashMap::default()
    };

    let ctx = TableContext {
        fields,
        reproject,
        index: &index,
        way_nodes,
        opts,
    };

    printlnt!("Processing {n_features} features from {table}");
    let mut pending_members: Vec<OsmElement> = Vec::new();
    {
        let ids = &mut ids;
        let writer = &mut writer;
        let stats = &mut stats;
        let pending_members = &mut pending_members;
        let ctx = &ctx;
        source.for_each_feature(table, &mut |feature| {
            stats.features += 1;
            match compile_feature(&feature, ctx, ids) {
                Ok(compiled) => {
                    write_compiled(writer, compiled, opts.modify_only, stats, pending_members)?;
                }
                Err(err) => {
                    printlnt!("Skipping feature {} of {table}: {err}", feature.fid);
                    stats.skipped += 1;
                }
            }
            Ok(())
        })?;
    }

    // node lists of every way we still have to touch: intersecting ways to
    // rewrite plus ways to delete
    let deletion_ids: Vec<Vec<i64>> = deletions
        .iter()
        .map(|t| source.ids(t, ID_COLUMN))
        .collect::<Result<_, _>>()?;
    let mut wanted: FxHashSet<i64> = FxHashSet::default();
    for list in index.intersecting_ids() {
        wanted.extend(list.iter().copied());
    }
    for list in &deletion_ids {
        wanted.extend(list.iter().copied());
    }
    let way_node_map = if wanted.is_empty() {
        FxHashMap::default()
    } else {
        osmpbf::way_node_map(osmsrc, &wanted)?
    };

    let mut modified_ways: Vec<OsmElement> = Vec::new();
    if !index.is_empty() {
        for (layer_idx, other) in existing.iter().enumerate() {
            let other_fields = source.fields(other)?;
            let other_reproject = Reprojector::to_wgs84(source.srid(other)?)?;
            let intersecting = &index.intersecting_ids()[layer_idx];
            printlnt!("Processing {} intersections from {other}", intersecting.len());
            for &id in intersecting {
                let Some(feature) = source.find(other, id, ID_COLUMN)? else {
                    printlnt!("Warning: feature {id} not found in {other}");
                    continue;
                };
                let Some(node_ids) = way_node_map.get(&id) else {
                    printlnt!("Warning: way {id} not found in {osmsrc}, is it a relation?");
                    continue;
                };
                let Some(wkt) = feature.geometry_wkt.as_deref() else {
                    printlnt!("Warning: feature {id} of {other} has no geometry");
                    continue;
                };
                let geom = match osmgeom::parse_wkt(wkt) {
                    Ok(geom) => geom,
                    Err(err) => {
                        printlnt!("Warning: skipping feature {id} of {other}: {err}");
                        continue;
                    }
                };
                let geom = other_reproject.transform_geometry(&geom)?;
                let tags = generate_tags(
                    &feature,
                    &other_fields,
                    opts.hstore_column.as_deref(),
                    &[],
                );

                match &geom {
                    Geometry::LineString(line) => {
                        match modify_existing_way(line, id, node_ids, tags, &index) {
                            Ok(way) => {
                                stats.modified_ways += 1;
                                modified_ways.push(way.into());
                            }
                            Err(err) => {
                                printlnt!("Warning: could not modify way {id}: {err}");
                            }
                        }
                    }
                    Geometry::Polygon(_) => {
                        // threading intersection nodes through a polygon
                        // relation boundary is not supported
                        printlnt!(
                            "Warning: a new feature intersects polygon {id}; it is left unmodified"
                        );
                    }
                    geom => {
                        printlnt!(
                            "Warning: unsupported geometry {} for intersecting feature {id}",
                            geometry_name(geom)
                        );
                    }
                }
            }
        }
    }
    if !modified_ways.is_empty() {
        writer.add_modify(&modified_ways)?;
    }

    // relations referenced by membership tags on the new objects
    if !pending_members.is_empty() {
        let mut relation_ids: FxHashSet<i64> = FxHashSet::default();
        for element in &pending_members {
            for tag in element.tags() {
                if tag.key.starts_with(MEMBER_OF_PREFIX) {
                    relation_ids
                        .extend(tag.value.split(',').filter_map(|v| v.trim().parse::<i64>().ok()));
                }
            }
        }
        let mut updater = RelationUpdater::new(osmpbf::relations_by_id(osmsrc, &relation_ids)?);
        for element in &pending_members {
            updater.modify_with(element, MEMBER_OF_PREFIX, None);
        }
        let modified: Vec<OsmElement> = updater
            .modified_relations()
            .into_iter()
            .cloned()
            .map(OsmElement::from)
            .collect();
        if !modified.is_empty() {
            stats.modified_relations += modified.len() as u64;
            writer.add_modify(&modified)?;
        }
    }

    // the shared intersection nodes, created once every way referencing them
    // has been written
    if !index.is_empty() {
        let nodes: Vec<OsmElement> = index
            .nodes()
            .iter()
            .cloned()
            .map(OsmElement::from)
            .collect();
        stats.created_nodes += nodes.len() as u64;
        writer.add_create(&nodes)?;
    }

    // deletions, constituent nodes first
    let all_deletions: Vec<i64> = deletion_ids.into_iter().flatten().collect();
    if !all_deletions.is_empty() {
        let elements = deletion_elements(&all_deletions, &way_node_map, opts.delete_nodes);
        stats.deleted += elements.len() as u64;
        writer.add_delete(&elements)?;
    }

    writer.close()?;
    printlnt!("Finished {table}: {}", serde_json::to_string(&stats)?);
    Ok(stats)
}

/// Produce a change file containing only deletions for every id in `table`
pub fn generate_deletions(
    source: &mut dyn SpatialSource,
    table: &str,
    id_field: &str,
    osmsrc: &str,
    outfile: &Path,
    opts: &Options,
) -> Result<RunStats, Box<dyn error::Error>> {
    let mut writer = OsmChangeWriter::create(outfile, opts.compress, opts.member_spelling)?;
    let mut stats = RunStats::default();

    printlnt!("Retrieving deletion ids from {table}");
    let way_ids = source.ids(table, id_field)?;
    let way_node_map = if opts.delete_nodes && !way_ids.is_empty() {
        let id_set: FxHashSet<i64> = way_ids.iter().copied().collect();
        osmpbf::way_node_map(osmsrc, &id_set)?
    } else {
        FxHashMap::default()
    };

    let elements = deletion_elements(&way_ids, &way_node_map, opts.delete_nodes);
    stats.deleted = elements.len() as u64;
    if !elements.is_empty() {
        writer.add_delete(&elements)?;
    }
    writer.close()?;
    printlnt!("Finished deletions for {table}: {}", serde_json::to_string(&stats)?);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IntersectionQuery, Intersections};
    use geo::line_string;
    use rustc_hash::FxHashSet;

    fn node_at(id: i64, lon: f64, lat: f64) -> Node {
        Node {
            id,
            version: 1,
            lat,
            lon,
            tags: vec![],
        }
    }

    fn index_with(nodes: Vec<Node>) -> IntersectionIndex {
        IntersectionIndex::from_nodes(nodes, vec![])
    }

    #[test]
    fn waysplitter_covers_all_ids() {
        let nds: Vec<i64> = (0..3000).collect();
        let mut ids = IdAllocator::new(10_000, false);
        let ways = make_ways(nds, vec![], &mut ids, Some(2000), false);

        assert!(ways.len() >= 2);
        let mut all: FxHashSet<i64> = FxHashSet::default();
        for way in &ways {
            assert!(way.nds.len() <= 2000);
            all.extend(way.nds.iter().copied());
        }
        assert_eq!(all.len(), 3000);
        for pair in ways.windows(2) {
            // consecutive sub-ways share exactly one id, the joiner node
            assert_eq!(pair[0].nds.last(), pair[1].nds.first());
            let first: FxHashSet<i64> = pair[0].nds.iter().copied().collect();
            let shared = pair[1].nds.iter().filter(|nd| first.contains(nd)).count();
            assert_eq!(shared, 1);
        }
    }

    #[test]
    fn short_list_is_one_way() {
        let mut ids = IdAllocator::new(0, true);
        let ways = make_ways(vec![1, 2, 3], vec![], &mut ids, Some(2000), false);
        assert_eq!(ways.len(), 1);
        assert_eq!(ways[0].nds, vec![1, 2, 3]);
        assert_eq!(ways[0].version, 1);
    }

    #[test]
    fn closed_way_repeats_first_id() {
        let mut ids = IdAllocator::new(0, false);
        let ways = make_ways(vec![1, 2, 3], vec![], &mut ids, Some(2000), true);
        assert_eq!(ways[0].nds, vec![1, 2, 3, 1]);
    }

    #[test]
    fn unlimited_list_is_one_way() {
        let nds: Vec<i64> = (0..5000).collect();
        let mut ids = IdAllocator::new(0, false);
        let ways = make_ways(nds, vec![], &mut ids, None, false);
        assert_eq!(ways.len(), 1);
        assert_eq!(ways[0].nds.len(), 5000);
    }

    #[test]
    fn linestring_without_intersections() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 0.001, y: 0.0), (x: 0.002, y: 0.0)];
        let mut ids = IdAllocator::new(100, false);
        let index = index_with(vec![]);
        let (ways, nodes) =
            generate_ways_and_nodes(&line, &mut ids, vec![], &index, Some(2000), false).unwrap();
        assert_eq!(ways.len(), 1);
        assert_eq!(nodes.len(), 3);
        assert_eq!(ways[0].nds, vec![100, 101, 102]);
    }

    #[test]
    fn vertex_reuses_intersection_node() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 0.001, y: 0.0), (x: 0.002, y: 0.0)];
        let mut ids = IdAllocator::new(100, false);
        let index = index_with(vec![node_at(5000, 0.001, 0.0)]);
        let (ways, nodes) =
            generate_ways_and_nodes(&line, &mut ids, vec![], &index, Some(2000), false).unwrap();
        assert_eq!(ways[0].nds[1], 5000);
        // no fresh node was created for the shared vertex
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.lon != 0.001));
    }

    #[test]
    fn intersection_node_inserted_mid_segment() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 0.001, y: 0.0), (x: 0.002, y: 0.0)];
        let mut ids = IdAllocator::new(100, false);
        let index = index_with(vec![node_at(5000, 0.0005, 0.0)]);
        let (ways, nodes) =
            generate_ways_and_nodes(&line, &mut ids, vec![], &index, Some(2000), false).unwrap();
        assert_eq!(ways[0].nds, vec![100, 5000, 101, 102]);
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn modify_way_inserts_node() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0), (x: 3.0, y: 0.0)];
        let index = index_with(vec![node_at(1000, 1.5, 0.0)]);
        let way =
            modify_existing_way(&line, 4242, &[10, 11, 12, 13], vec![], &index).unwrap();
        assert_eq!(way.id, 4242);
        assert_eq!(way.version, 2);
        assert_eq!(way.nds, vec![10, 11, 1000, 12, 13]);
    }

    #[test]
    fn modify_way_replaces_coinciding_vertex() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0), (x: 3.0, y: 0.0)];
        // rounds to the position of the third vertex but projects before it
        let index = index_with(vec![node_at(2000, 1.999_999_9, 0.0)]);
        let way =
            modify_existing_way(&line, 4242, &[10, 11, 12, 13], vec![], &index).unwrap();
        assert_eq!(way.nds, vec![10, 11, 2000, 13]);
    }

    #[test]
    fn modify_way_without_candidates_is_unchanged() {
        let line = line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)];
        let index = index_with(vec![node_at(1000, 50.0, 50.0)]);
        let way = modify_existing_way(&line, 7, &[10, 11], vec![], &index).unwrap();
        assert_eq!(way.nds, vec![10, 11]);
    }

    #[test]
    fn tags_from_columns_and_hstore() {
        let feature = Feature {
            fid: 0,
            geometry_wkt: None,
            fields: vec![
                (String::from("name"), String::from("Wonderland Trail")),
                (
                    String::from("other_tags"),
                    String::from("\"sac_scale\"=>\"hiking\", \"name\"=>\"Shadowed\""),
                ),
            ],
        };
        let fields = vec![String::from("name"), String::from("other_tags")];
        let tags = generate_tags(&feature, &fields, Some("other_tags"), &[]);
        assert_eq!(
            tags,
            vec![
                Tag::new("name", "Wonderland Trail"),
                Tag::new("sac_scale", "hiking"),
            ]
        );
    }

    #[test]
    fn tags_exclusion() {
        let feature = Feature {
            fid: 0,
            geometry_wkt: None,
            fields: vec![
                (String::from("name"), String::from("x")),
                (String::from("osm_id"), String::from("55")),
            ],
        };
        let fields = vec![String::from("name"), String::from("osm_id")];
        let tags = generate_tags(&feature, &fields, None, &["osm_id"]);
        assert_eq!(tags, vec![Tag::new("name", "x")]);
    }

    #[test]
    fn broken_hstore_contributes_nothing() {
        let feature = Feature {
            fid: 0,
            geometry_wkt: None,
            fields: vec![(String::from("other_tags"), String::from("not=>hstore"))],
        };
        let fields = vec![String::from("other_tags")];
        let tags = generate_tags(&feature, &fields, Some("other_tags"), &[]);
        assert!(tags.is_empty());
    }

    fn table_ctx<'a>(
        index: &'a IntersectionIndex,
        opts: &'a Options,
        fields: Vec<String>,
        way_nodes: FxHashMap<i64, Vec<i64>>,
    ) -> TableContext<'a> {
        TableContext {
            fields,
            reproject: Reprojector::to_wgs84(4326).unwrap(),
            index,
            way_nodes,
            opts,
        }
    }

    #[test]
    fn compile_point_feature() {
        let index = index_with(vec![]);
        let opts = Options::default();
        let ctx = table_ctx(&index, &opts, vec![String::from("name")], FxHashMap::default());
        let feature = Feature {
            fid: 0,
            geometry_wkt: Some(String::from("POINT (-122.33 47.6)")),
            fields: vec![(String::from("name"), String::from("Summit"))],
        };
        let mut ids = IdAllocator::new(100, false);
        let compiled = compile_feature(&feature, &ctx, &mut ids).unwrap();
        assert_eq!(compiled.nodes.len(), 1);
        assert_eq!(compiled.nodes[0].id, 100);
        assert_eq!(compiled.nodes[0].version, 1);
        assert!((compiled.nodes[0].lat - 47.6).abs() < 1e-9);
        assert_eq!(compiled.nodes[0].tags, vec![Tag::new("name", "Summit")]);
    }

    #[test]
    fn compile_modify_only_point() {
        let index = index_with(vec![]);
        let opts = Options {
            modify_only: true,
            ..Options::default()
        };
        let fields = vec![String::from("name"), String::from("osm_id")];
        let ctx = table_ctx(&index, &opts, fields, FxHashMap::default());
        let feature = Feature {
            fid: 0,
            geometry_wkt: Some(String::from("POINT (-122.33 47.6)")),
            fields: vec![
                (String::from("name"), String::from("Summit")),
                (String::from("osm_id"), String::from("987")),
            ],
        };
        let mut ids = IdAllocator::new(100, false);
        let compiled = compile_feature(&feature, &ctx, &mut ids).unwrap();
        assert_eq!(compiled.nodes[0].id, 987);
        assert_eq!(compiled.nodes[0].version, 2);
        // the osm_id column does not come back as a tag
        assert_eq!(compiled.nodes[0].tags, vec![Tag::new("name", "Summit")]);
    }

    #[test]
    fn compile_modify_only_linestring() {
        let index = index_with(vec![]);
        let opts = Options {
            modify_only: true,
            ..Options::default()
        };
        let fields = vec![String::from("osm_id")];
        let mut way_nodes = FxHashMap::default();
        way_nodes.insert(654, vec![1, 2, 3]);
        let ctx = table_ctx(&index, &opts, fields, way_nodes);
        let feature = Feature {
            fid: 0,
            geometry_wkt: Some(String::from("LINESTRING (0 0, 0.001 0)")),
            fields: vec![(String::from("osm_id"), String::from("654"))],
        };
        let mut ids = IdAllocator::new(100, false);
        let compiled = compile_feature(&feature, &ctx, &mut ids).unwrap();
        assert_eq!(compiled.ways.len(), 1);
        assert_eq!(compiled.ways[0].id, 654);
        assert_eq!(compiled.ways[0].version, 2);
        // geometry is untouched, the node list comes from the OSM source
        assert_eq!(compiled.ways[0].nds, vec![1, 2, 3]);
        assert!(compiled.nodes.is_empty());
    }

    #[test]
    fn compile_modify_only_missing_way() {
        let index = index_with(vec![]);
        let opts = Options {
            modify_only: true,
            ..Options::default()
        };
        let ctx = table_ctx(
            &index,
            &opts,
            vec![String::from("osm_id")],
            FxHashMap::default(),
        );
        let feature = Feature {
            fid: 0,
            geometry_wkt: Some(String::from("LINESTRING (0 0, 0.001 0)")),
            fields: vec![(String::from("osm_id"), String::from("654"))],
        };
        let mut ids = IdAllocator::new(100, false);
        match compile_feature(&feature, &ctx, &mut ids) {
            Err(FeatureError::WayNotFound(654)) => (),
            other => panic!("expected WayNotFound, got {other:?}"),
        }
    }

    #[test]
    fn compile_simple_polygon() {
        let index = index_with(vec![]);
        let opts = Options::default();
        let ctx = table_ctx(&index, &opts, vec![], FxHashMap::default());
        let feature = Feature {
            fid: 0,
            geometry_wkt: Some(String::from(
                "POLYGON ((0 0, 0.001 0, 0.001 0.001, 0 0.001, 0 0))",
            )),
            fields: vec![],
        };
        let mut ids = IdAllocator::new(100, false);
        let compiled = compile_feature(&feature, &ctx, &mut ids).unwrap();
        assert_eq!(compiled.ways.len(), 1);
        assert!(compiled.relations.is_empty());
        let nds = &compiled.ways[0].nds;
        assert_eq!(nds.first(), nds.last());
        // four corners, the ring closure is an id repetition rather than a node
        assert_eq!(compiled.nodes.len(), 4);
    }

    #[test]
    fn compile_polygon_with_hole() {
        let index = index_with(vec![]);
        let opts = Options::default();
        let ctx = table_ctx(&index, &opts, vec![String::from("name")], FxHashMap::default());
        let feature = Feature {
            fid: 0,
            geometry_wkt: Some(String::from(
                "POLYGON ((0 0, 0.01 0, 0.01 0.01, 0 0.01, 0 0), \
                 (0.004 0.004, 0.006 0.004, 0.006 0.006, 0.004 0.006, 0.004 0.004))",
            )),
            fields: vec![(String::from("name"), String::from("Pond"))],
        };
        let mut ids = IdAllocator::new(100, false);
        let compiled = compile_feature(&feature, &ctx, &mut ids).unwrap();
        assert_eq!(compiled.ways.len(), 2);
        // constituent ways are tagless, the relation carries the tags
        assert!(compiled.ways.iter().all(|way| way.tags.is_empty()));
        assert_eq!(compiled.relations.len(), 1);
        let relation = &compiled.relations[0];
        assert_eq!(relation.members.len(), 2);
        assert_eq!(relation.members[0].role, "outer");
        assert_eq!(relation.members[1].role, "inner");
        assert!(relation.tags.contains(&Tag::new("name", "Pond")));
        assert!(relation.tags.contains(&Tag::new("type", "multipolygon")));
    }

    #[test]
    fn compile_multi_geometry_fails() {
        let index = index_with(vec![]);
        let opts = Options::default();
        let ctx = table_ctx(&index, &opts, vec![], FxHashMap::default());
        let feature = Feature {
            fid: 0,
            geometry_wkt: Some(String::from(
                "MULTILINESTRING ((0 0, 1 0), (2 0, 3 0))",
            )),
            fields: vec![],
        };
        let mut ids = IdAllocator::new(100, false);
        match compile_feature(&feature, &ctx, &mut ids) {
            Err(FeatureError::MultiGeometry) => (),
            other => panic!("expected MultiGeometry, got {other:?}"),
        }
    }

    #[test]
    fn deletion_batch_order_and_dedup() {
        let mut map: FxHashMap<i64, Vec<i64>> = FxHashMap::default();
        map.insert(1, vec![10, 11]);
        map.insert(2, vec![11, 12]);
        map.insert(3, vec![13]);
        let elements = deletion_elements(&[1, 2, 3], &map, true);

        let described: Vec<(i64, bool)> = elements
            .iter()
            .map(|element| (element.id(), matches!(element, OsmElement::Way(_))))
            .collect();
        // per way: its nodes first, then the way; node 11 appears only once
        assert_eq!(
            described,
            vec![
                (10, false),
                (11, false),
                (1, true),
                (12, false),
                (2, true),
                (13, false),
                (3, true),
            ]
        );
        for element in &elements {
            match element {
                OsmElement::Node(node) => {
                    assert_eq!(node.version, 99);
                    assert_eq!((node.lat, node.lon), (0.0, 0.0));
                }
                OsmElement::Way(way) => {
                    assert_eq!(way.version, 99);
                    assert!(way.nds.is_empty());
                }
                OsmElement::Relation(_) => panic!("no relations expected"),
            }
        }
    }

    #[test]
    fn deletion_batch_without_nodes() {
        let map: FxHashMap<i64, Vec<i64>> = FxHashMap::default();
        let elements = deletion_elements(&[5, 6], &map, false);
        assert_eq!(elements.len(), 2);
        assert!(elements.iter().all(|e| matches!(e, OsmElement::Way(_))));
    }

    /// In-memory source with one layer of WGS84 features
    struct MockSource {
        layer: String,
        features: Vec<Feature>,
        deletion_ids: Vec<i64>,
    }

    impl SpatialSource for MockSource {
        fn layers(&mut self) -> Result<Vec<String>, crate::db::Error> {
            Ok(vec![self.layer.clone()])
        }
        fn fields(&mut self, _layer: &str) -> Result<Vec<String>, crate::db::Error> {
            Ok(vec![String::from("name")])
        }
        fn srid(&mut self, _layer: &str) -> Result<u32, crate::db::Error> {
            Ok(4326)
        }
        fn count(&mut self, _layer: &str) -> Result<u64, crate::db::Error> {
            Ok(self.features.len() as u64)
        }
        fn for_each_feature(
            &mut self,
            _layer: &str,
            op: &mut dyn FnMut(Feature) -> Result<(), Box<dyn error::Error>>,
        ) -> Result<(), Box<dyn error::Error>> {
            for feature in &self.features {
                op(feature.clone())?;
            }
            Ok(())
        }
        fn find(
            &mut self,
            _layer: &str,
            _id: i64,
            _id_field: &str,
        ) -> Result<Option<Feature>, crate::db::Error> {
            Ok(None)
        }
        fn ids(&mut self, _layer: &str, _field: &str) -> Result<Vec<i64>, crate::db::Error> {
            Ok(self.deletion_ids.clone())
        }
        fn intersections(
            &mut self,
            _query: &IntersectionQuery,
        ) -> Result<Intersections, crate::db::Error> {
            Ok(Intersections::default())
        }
    }

    #[test]
    fn generate_changes_creates_ways() {
        let mut source = MockSource {
            layer: String::from("trails_new"),
            deletion_ids: vec![],
            features: vec![
                Feature {
                    fid: 0,
                    geometry_wkt: Some(String::from("LINESTRING (0 0, 0.001 0, 0.002 0)")),
                    fields: vec![(String::from("name"), String::from("A"))],
                },
                Feature {
                    fid: 1,
                    geometry_wkt: Some(String::from("LINESTRING (0 0.01, 0.001 0.01)")),
                    fields: vec![(String::from("name"), String::from("B"))],
                },
                Feature {
                    fid: 2,
                    // multi geometries are skipped, the run continues
                    geometry_wkt: Some(String::from("MULTIPOLYGON (((0 0, 1 0, 1 1, 0 0)))")),
                    fields: vec![(String::from("name"), String::from("C"))],
                },
            ],
        };

        let out = tempfile::NamedTempFile::new().unwrap();
        let opts = Options {
            id_offset: 1000,
            ..Options::default()
        };
        let stats = generate_changes(
            &mut source,
            "trails_new",
            &[],
            &[],
            "unused.osm.pbf",
            out.path(),
            &opts,
        )
        .unwrap();

        assert_eq!(stats.features, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.created_ways, 2);
        assert_eq!(stats.created_nodes, 5);

        let content = std::fs::read_to_string(out.path()).unwrap();
        assert!(content.starts_with("<osmChange"));
        assert_eq!(content.matches("<way ").count(), 2);
        assert_eq!(content.matches("<node ").count(), 5);
        assert!(content.contains("<tag k=\"name\" v=\"A\"/>"));
        assert!(content.trim_end().ends_with("</osmChange>"));
    }

    #[test]
    fn generate_deletions_writes_delete_block() {
        let mut source = MockSource {
            layer: String::from("trails_deleted"),
            deletion_ids: vec![17, 18],
            features: vec![],
        };
        let out = tempfile::NamedTempFile::new().unwrap();
        let opts = Options {
            // without node deletion the OSM source is never read
            delete_nodes: false,
            ..Options::default()
        };
        let stats = generate_deletions(
            &mut source,
            "trails_deleted",
            "osm_id",
            "unused.osm.pbf",
            out.path(),
            &opts,
        )
        .unwrap();

        assert_eq!(stats.deleted, 2);
        let content = std::fs::read_to_string(out.path()).unwrap();
        assert!(content.contains("<delete>"));
        assert!(content.contains("<way id=\"17\" version=\"99\">"));
        assert!(content.contains("<way id=\"18\" version=\"99\">"));
    }
}

