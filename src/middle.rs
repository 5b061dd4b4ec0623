//! Middle: cache of parsed OSM objects
//!
//! The middle sits between ingest and output: ways resolve node
//! coordinates through it, relations resolve member geometries. Two
//! backends exist, an in-memory one for one-shot imports
//! ([`ram::RamMiddle`]) and a database-persisted ("slim") one that
//! enables incremental updates ([`pgsql::PgMiddle`]).
//!
//! After ingest the middle becomes read-only; worker threads then share
//! it through [`MiddleRead`] handles obtained from
//! [`Middle::query_handle`].

pub mod flatnodes;
pub mod pgsql;
pub mod ram;

use std::io;
use thiserror::Error;

use crate::geom::Point;
use crate::osm::{Member, Osmid, Tags};

/// Way as stored by the middle: tags and node references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WayEntry {
    pub tags: Tags,
    pub nodes: Vec<Osmid>,
}

/// Relation as stored by the middle: tags and members.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelEntry {
    pub tags: Tags,
    pub members: Vec<Member>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] postgres::Error),
    #[error("flat node file cannot store negative node id {0}")]
    NegativeId(Osmid),
    #[error("{0}")]
    Corrupt(String),
}

/// Read-only view of the middle.
///
/// During ingest this is the ingesting thread's own view; during the
/// pending stages every worker holds an independent handle. A cache miss
/// is not an error, the caller emits a null geometry and carries on.
pub trait MiddleRead {
    /// Location of a node in WGS84 degrees.
    fn node(&self, id: Osmid) -> Option<Point>;

    /// Resolve a list of node references, silently skipping nodes that
    /// are not in the cache. The length of the result is the number of
    /// found nodes.
    fn node_list(&self, ids: &[Osmid]) -> Vec<Point> {
        ids.iter().filter_map(|&id| self.node(id)).collect()
    }

    fn way(&self, id: Osmid) -> Option<WayEntry>;

    fn relation(&self, id: Osmid) -> Option<RelEntry>;
}

/// The owning side of the middle. Writes only happen during ingest,
/// single-threaded; afterwards the middle is read-only.
pub trait Middle: MiddleRead {
    fn put_node(&mut self, id: Osmid, lon: f64, lat: f64) -> Result<(), Error>;

    fn put_way(&mut self, id: Osmid, tags: Tags, nodes: Vec<Osmid>) -> Result<(), Error>;

    fn put_relation(&mut self, id: Osmid, tags: Tags, members: Vec<Member>) -> Result<(), Error>;

    /// Delete hooks for update mode.
    fn delete_node(&mut self, id: Osmid) -> Result<(), Error>;
    fn delete_way(&mut self, id: Osmid) -> Result<(), Error>;
    fn delete_relation(&mut self, id: Osmid) -> Result<(), Error>;

    /// Phase transitions driven by the input ordering.
    fn after_nodes(&mut self) -> Result<(), Error> {
        Ok(())
    }
    fn after_ways(&mut self) -> Result<(), Error> {
        Ok(())
    }
    fn after_relations(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// This middle as a plain reader, for the single-threaded ingest
    /// phase.
    fn as_read(&self) -> &dyn MiddleRead;

    /// Reverse-reference queries, when this backend supports them.
    fn backrefs(&self) -> Option<&dyn BackRefs> {
        None
    }

    /// A read-only handle for a worker thread. The handle borrows the
    /// middle, so workers must finish before the middle is dropped; the
    /// slim backend opens its own database connection per handle.
    fn query_handle(&self) -> Result<Box<dyn MiddleRead + Send + '_>, Error>;

    /// End-of-import maintenance. With `droptemp` the persisted middle
    /// tables are dropped, otherwise they get their indexes. The
    /// returned statements are executed by the driver's maintenance
    /// pool.
    fn stop(&mut self, droptemp: bool) -> Result<Vec<crate::copy::MaintenanceTask>, Error> {
        let _ = droptemp;
        Ok(Vec::new())
    }
}

/// Reverse-reference queries, used by the dependency manager in append
/// mode. Only the slim backend can answer them; that append mode
/// requires the slim backend is enforced at configuration time.
pub trait BackRefs {
    /// Ids of all ways referencing the node, sorted.
    fn ways_using_node(&self, id: Osmid) -> Result<Vec<Osmid>, Error>;

    /// Ids of all relations referencing the way, sorted.
    fn relations_using_way(&self, id: Osmid) -> Result<Vec<Osmid>, Error>;
}
