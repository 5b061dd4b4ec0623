//! Coordinate reprojection
//!
//! OSM input is WGS84 latitude/longitude; the usual database target is
//! spherical Mercator so renderers can use the rows directly.

use crate::geom::{Point, SRID_MERC, SRID_WGS84};

/// Circumference of the earth at the equator in Mercator metres. Must
/// match the tile maths in the expiry tracker.
pub const EARTH_CIRCUMFERENCE: f64 = 40075016.68;
pub const HALF_EARTH_CIRCUMFERENCE: f64 = EARTH_CIRCUMFERENCE / 2.0;

const EARTH_RADIUS: f64 = 6378137.0;

/// Latitudes beyond this are clamped before projecting; the Mercator pole
/// is at infinity.
const MAX_LATITUDE: f64 = 89.99;

/// Convert a WGS84 lon/lat point to spherical-Mercator metres.
pub fn lonlat_to_merc(p: Point) -> Point {
    let lat = p.y.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    Point {
        x: EARTH_RADIUS * p.x.to_radians(),
        y: EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln(),
    }
}

/// Target projection of the output tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reprojection {
    /// Keep WGS84 lon/lat (SRID 4326).
    LatLong,
    /// Spherical Mercator (SRID 3857).
    SphericalMercator,
}

impl Reprojection {
    pub fn from_srid(srid: i32) -> Option<Reprojection> {
        match srid {
            SRID_WGS84 => Some(Reprojection::LatLong),
            SRID_MERC => Some(Reprojection::SphericalMercator),
            _ => None,
        }
    }

    pub fn target_srid(&self) -> i32 {
        match self {
            Reprojection::LatLong => SRID_WGS84,
            Reprojection::SphericalMercator => SRID_MERC,
        }
    }

    /// Project a WGS84 lon/lat point into the target system.
    pub fn reproject(&self, p: Point) -> Point {
        match self {
            Reprojection::LatLong => p,
            Reprojection::SphericalMercator => lonlat_to_merc(p),
        }
    }

    /// Convert a point in target coordinates to tile space: fractional
    /// x/y with `map_width` tiles across the world, y growing southward.
    pub fn target_to_tile(&self, p: Point, map_width: i32) -> (f64, f64) {
        let merc = match self {
            Reprojection::LatLong => lonlat_to_merc(p),
            Reprojection::SphericalMercator => p,
        };
        let width = f64::from(map_width);
        (
            (merc.x + HALF_EARTH_CIRCUMFERENCE) / EARTH_CIRCUMFERENCE * width,
            (HALF_EARTH_CIRCUMFERENCE - merc.y) / EARTH_CIRCUMFERENCE * width,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merc_origin() {
        let p = lonlat_to_merc(Point::new(0.0, 0.0));
        assert!(p.x.abs() < 1e-9);
        assert!(p.y.abs() < 1e-9);
    }

    #[test]
    fn merc_known_point() {
        // 180° maps to half the earth circumference
        let p = lonlat_to_merc(Point::new(180.0, 0.0));
        assert!((p.x - HALF_EARTH_CIRCUMFERENCE).abs() < 1.0);

        // Mercator is conformal at the equator: x == y for (d, d) near 0
        let p = lonlat_to_merc(Point::new(1.0, 0.0));
        let q = lonlat_to_merc(Point::new(0.0, 1.0));
        assert!((p.x - q.y).abs() < 20.0);
    }

    #[test]
    fn poles_clamped() {
        let p = lonlat_to_merc(Point::new(0.0, 90.0));
        assert!(p.y.is_finite());
        let q = lonlat_to_merc(Point::new(0.0, -90.0));
        assert!((p.y + q.y).abs() < 1e-6);
    }

    #[test]
    fn tile_coords() {
        let proj = Reprojection::SphericalMercator;
        // the world center is in the middle of the tile grid
        let (x, y) = proj.target_to_tile(Point::new(0.0, 0.0), 256);
        assert!((x - 128.0).abs() < 1e-6);
        assert!((y - 128.0).abs() < 1e-6);

        // lat/lon targets are converted through Mercator first
        let (x, y) = Reprojection::LatLong.target_to_tile(Point::new(0.0, 0.0), 256);
        assert!((x - 128.0).abs() < 1e-6);
        assert!((y - 128.0).abs() < 1e-6);
    }
}
