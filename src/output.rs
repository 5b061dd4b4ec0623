//! Output pipelines
//!
//! An output turns OSM objects into database rows. The driver feeds it
//! during ingest and during the pending stages; geometry is materialised
//! through the middle handle passed into each call, so worker threads
//! can run clones of an output against their own middle handle and COPY
//! thread.

pub mod null;
pub mod pgsql;

use std::sync::Arc;
use thiserror::Error;

use crate::copy::{CopyThread, MaintenanceTask};
use crate::expire::ExpireTiles;
use crate::middle::{self, MiddleRead};
use crate::osm::{Node, Osmid, Relation, Way};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] postgres::Error),
    #[error(transparent)]
    Middle(#[from] middle::Error),
}

pub trait Output: Send {
    /// Prepare the output tables.
    fn start(&mut self) -> Result<(), Error>;

    fn node_add(&mut self, node: &Node) -> Result<(), Error>;
    fn node_modify(&mut self, node: &Node) -> Result<(), Error>;
    fn node_delete(&mut self, id: Osmid) -> Result<(), Error>;

    fn way_add(&mut self, way: &Way, mid: &dyn MiddleRead) -> Result<(), Error>;
    fn way_modify(&mut self, way: &Way, mid: &dyn MiddleRead) -> Result<(), Error>;
    fn way_delete(&mut self, id: Osmid) -> Result<(), Error>;

    fn relation_add(&mut self, rel: &Relation, mid: &dyn MiddleRead) -> Result<(), Error>;
    fn relation_modify(&mut self, rel: &Relation, mid: &dyn MiddleRead) -> Result<(), Error>;
    fn relation_delete(&mut self, id: Osmid) -> Result<(), Error>;

    /// Re-emit a way whose geometry changed because one of its nodes
    /// did.
    fn pending_way(&mut self, id: Osmid, mid: &dyn MiddleRead) -> Result<(), Error>;

    /// Re-emit a relation whose geometry changed because a member way
    /// did.
    fn pending_relation(&mut self, id: Osmid, mid: &dyn MiddleRead) -> Result<(), Error>;

    /// Like `pending_relation`, but does not mark member ways again;
    /// used for relations that became pending through marked ways.
    fn pending_relation_stage1c(&mut self, id: Osmid, mid: &dyn MiddleRead) -> Result<(), Error>;

    /// Way ids this output marked for later reprocessing. Drains the
    /// set.
    fn take_marked_way_ids(&mut self) -> Vec<Osmid>;

    /// Stage 2: reprocess the objects marked during stage 1.
    fn reprocess_marked(&mut self, mid: &dyn MiddleRead) -> Result<(), Error>;

    /// Wait until everything sent so far is committed.
    fn sync(&mut self);

    /// End-of-import maintenance statements (cluster, index, analyze),
    /// run by the driver's maintenance pool.
    fn stop(&mut self) -> Result<Vec<MaintenanceTask>, Error>;

    /// Clone this output for a worker thread, writing through the given
    /// COPY thread.
    fn clone_for_worker(&self, copy: &Arc<CopyThread>) -> Result<Box<dyn Output>, Error>;

    /// Take this output's expiry tree, leaving a fresh one. None when
    /// tile expiry is not enabled.
    fn take_expire_tree(&mut self) -> Option<ExpireTiles>;

    /// Union a worker's expiry tree into this output's.
    fn merge_expire_tree(&mut self, tree: ExpireTiles);
}
