//! Generate OpenStreetMap change files from a PostGIS conflation database
//!
//! osm-changegen reads "new", "modified" and "deleted" feature tables from a
//! PostGIS database, looks up existing identifiers in an OSM pbf extract, and
//! writes OSMChange documents describing the additions, modifications and
//! deletions. Intersection points between new linestrings and existing ways
//! become shared nodes threaded through both geometries, so the patched
//! dataset stays topologically connected.

pub mod db;
pub mod generator;
pub mod idgen;
pub mod intersections;
pub mod osm;
pub mod osmchange;
pub mod osmgeom;
pub mod osmpbf;
pub mod relations;
