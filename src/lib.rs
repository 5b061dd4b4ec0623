//! Import OpenStreetMap data into a PostgreSQL/PostGIS database
//!
//! osm-pgsql-rust reads OSM files (planet extracts or change files),
//! caches the primitives in a middle layer, builds point/line/polygon
//! geometries from them and streams the resulting rows into database
//! tables using COPY. With the slim middle, change files can be applied
//! incrementally and the affected tiles written to an expiry list.

pub mod copy;
pub mod deps;
pub mod driver;
pub mod ewkb;
pub mod expire;
pub mod geom;
pub mod input;
pub mod middle;
pub mod options;
pub mod osc;
pub mod osm;
pub mod output;
pub mod pbf;
pub mod projection;
