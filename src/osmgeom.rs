//! Geometry support: WKT parsing, reprojection and polyline arithmetic

use geo::{Coord, Geometry, LineString, MapCoords, Point};
use geo::{EuclideanDistance, LineLocatePoint};
use geos::{self, Geom};
use proj4rs;
use thiserror;
use wkt::TryFromWkt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not parse WKT geometry: {0}")]
    Wkt(String),
    #[error("unknown EPSG code {0}")]
    UnknownEpsg(u32),
    #[error(transparent)]
    Projection(#[from] proj4rs::errors::Error),
    #[error(transparent)]
    Geos(#[from] geos::Error),
}

/// Parse a WKT string into a [`geo`] geometry
pub fn parse_wkt(wkt_str: &str) -> Result<Geometry<f64>, Error> {
    Geometry::try_from_wkt_str(wkt_str)
        .map_err(|_| Error::Wkt(wkt_str.chars().take(80).collect()))
}

/// Coordinate transformer from a source EPSG code into WGS84
pub struct Reprojector {
    from: proj4rs::Proj,
    to: proj4rs::Proj,
}

impl Reprojector {
    pub fn to_wgs84(epsg: u32) -> Result<Reprojector, Error> {
        let code = u16::try_from(epsg).map_err(|_| Error::UnknownEpsg(epsg))?;
        let from =
            proj4rs::Proj::from_epsg_code(code).map_err(|_| Error::UnknownEpsg(epsg))?;
        let to = proj4rs::Proj::from_epsg_code(4326)?;
        Ok(Reprojector { from, to })
    }

    /// Transform one position; returns (lon, lat) in degrees.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), Error> {
        let mut point = (x, y, 0.0);
        if self.from.is_latlong() {
            point.0 = point.0.to_radians();
            point.1 = point.1.to_radians();
        }
        proj4rs::transform::transform(&self.from, &self.to, &mut point)?;
        if self.to.is_latlong() {
            point.0 = point.0.to_degrees();
            point.1 = point.1.to_degrees();
        }
        Ok((point.0, point.1))
    }

    /// Transform every coordinate of a geometry.
    pub fn transform_geometry(&self, geom: &Geometry<f64>) -> Result<Geometry<f64>, Error> {
        geom.try_map_coords(|Coord { x, y }| {
            let (lon, lat) = self.transform(x, y)?;
            Ok(Coord { x: lon, y: lat })
        })
    }
}

/// Index before which `point` should be inserted into `line`
///
/// Projects the point onto the polyline as a fraction of its total length,
/// computes the cumulative fractional distance of every original vertex, and
/// returns the smallest index whose fraction exceeds the projection. When the
/// projection lands past every breakpoint the last index is returned, so the
/// insertion happens before the final vertex.
pub fn point_insertion_index(line: &LineString<f64>, point: &Point<f64>) -> usize {
    let count = line.0.len();
    if count < 2 {
        return count.saturating_sub(1);
    }
    let Some(fraction) = line.line_locate_point(point) else {
        return count - 1;
    };

    let mut total = 0.0;
    let mut cumulative = Vec::with_capacity(count);
    cumulative.push(0.0);
    for pair in line.0.windows(2) {
        total += Point::from(pair[0]).euclidean_distance(&Point::from(pair[1]));
        cumulative.push(total);
    }
    if total == 0.0 {
        return count - 1;
    }
    for (idx, travelled) in cumulative.iter().enumerate() {
        if fraction < travelled / total {
            return idx;
        }
    }
    count - 1
}

/// Convert a [`geo`] geometry to its GEOS representation
pub fn to_geos(geom: &Geometry<f64>) -> Result<geos::Geometry, Error> {
    Ok(geom.try_into()?)
}

/// Test whether a point lies on `geom`.
pub fn point_intersects(geom: &geos::Geometry, lon: f64, lat: f64) -> Result<bool, Error> {
    let point: geos::Geometry = (&Point::new(lon, lat)).try_into()?;
    Ok(point.intersects(geom)?)
}

/// Test whether a point buffered by `buffer` degrees intersects `geom`.
pub fn buffered_point_intersects(
    geom: &geos::Geometry,
    lon: f64,
    lat: f64,
    buffer: f64,
) -> Result<bool, Error> {
    let point: geos::Geometry = (&Point::new(lon, lat)).try_into()?;
    let zone = point.buffer(buffer, 8)?;
    Ok(geom.intersects(&zone)?)
}
