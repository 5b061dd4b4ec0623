//! Geometry values built from OSM objects
//!
//! The geometry model is a tagged sum carrying an SRID. Values are plain
//! data: they can be compared, cloned and moved across threads, and the
//! EWKB encoder in [`ewkb`](crate::ewkb) round-trips them bit-exactly.

pub mod build;
pub mod ops;

/// WGS84 latitude/longitude.
pub const SRID_WGS84: i32 = 4326;
/// Spherical-Mercator, the usual projected target.
pub const SRID_MERC: i32 = 3857;

/// A point in the plane (or on the globe, for SRID 4326).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Point {
        Point { x, y }
    }
}

/// An open or closed sequence of points.
pub type PointList = Vec<Point>;

/// A polygon with one outer ring and any number of inner rings (holes).
///
/// Rings are closed: first point equals last point. Inner rings are
/// expected to lie within the outer ring; this is not enforced
/// structurally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Polygon {
    pub outer: PointList,
    pub inners: Vec<PointList>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Null,
    Point(Point),
    Linestring(PointList),
    Polygon(Polygon),
    Multipoint(Vec<Point>),
    Multilinestring(Vec<PointList>),
    Multipolygon(Vec<Polygon>),
    /// Heterogeneous members. Sub-geometries carry srid 0; the SRID of the
    /// collection applies to all of them.
    Collection(Vec<Geometry>),
}

/// A geometry value with its spatial reference system.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub srid: i32,
    pub data: Data,
}

impl Geometry {
    /// The null geometry, result of every failed construction.
    pub fn null() -> Geometry {
        Geometry {
            srid: SRID_WGS84,
            data: Data::Null,
        }
    }

    pub fn new(data: Data, srid: i32) -> Geometry {
        Geometry { srid, data }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.data, Data::Null)
    }

    pub fn is_multi(&self) -> bool {
        matches!(
            self.data,
            Data::Multipoint(_)
                | Data::Multilinestring(_)
                | Data::Multipolygon(_)
                | Data::Collection(_)
        )
    }

    /// Number of sub-geometries: 1 for singular geometries, 0 for null.
    pub fn num_geometries(&self) -> usize {
        match &self.data {
            Data::Null => 0,
            Data::Point(_) | Data::Linestring(_) | Data::Polygon(_) => 1,
            Data::Multipoint(p) => p.len(),
            Data::Multilinestring(l) => l.len(),
            Data::Multipolygon(p) => p.len(),
            Data::Collection(c) => c.len(),
        }
    }

    /// Geometry type name as used by the database.
    pub fn type_name(&self) -> &'static str {
        match &self.data {
            Data::Null => "NULL",
            Data::Point(_) => "POINT",
            Data::Linestring(_) => "LINESTRING",
            Data::Polygon(_) => "POLYGON",
            Data::Multipoint(_) => "MULTIPOINT",
            Data::Multilinestring(_) => "MULTILINESTRING",
            Data::Multipolygon(_) => "MULTIPOLYGON",
            Data::Collection(_) => "GEOMETRYCOLLECTION",
        }
    }

    /// Dimension of the highest-dimension part: 0 for points, 1 for lines,
    /// 2 for polygons.
    pub fn dimension(&self) -> u32 {
        match &self.data {
            Data::Null | Data::Point(_) | Data::Multipoint(_) => 0,
            Data::Linestring(_) | Data::Multilinestring(_) => 1,
            Data::Polygon(_) | Data::Multipolygon(_) => 2,
            Data::Collection(c) => c.iter().map(Geometry::dimension).max().unwrap_or(0),
        }
    }
}
