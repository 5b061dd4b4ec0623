//! Output that discards everything. Useful for cache-priming runs and
//! as a stand-in in driver tests.

use std::sync::Arc;

use crate::copy::{CopyThread, MaintenanceTask};
use crate::expire::ExpireTiles;
use crate::middle::MiddleRead;
use crate::osm::{Node, Osmid, Relation, Way};
use crate::output::{Error, Output};

#[derive(Default)]
pub struct NullOutput;

impl Output for NullOutput {
    fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn node_add(&mut self, _node: &Node) -> Result<(), Error> {
        Ok(())
    }

    fn node_modify(&mut self, _node: &Node) -> Result<(), Error> {
        Ok(())
    }

    fn node_delete(&mut self, _id: Osmid) -> Result<(), Error> {
        Ok(())
    }

    fn way_add(&mut self, _way: &Way, _mid: &dyn MiddleRead) -> Result<(), Error> {
        Ok(())
    }

    fn way_modify(&mut self, _way: &Way, _mid: &dyn MiddleRead) -> Result<(), Error> {
        Ok(())
    }

    fn way_delete(&mut self, _id: Osmid) -> Result<(), Error> {
        Ok(())
    }

    fn relation_add(&mut self, _rel: &Relation, _mid: &dyn MiddleRead) -> Result<(), Error> {
        Ok(())
    }

    fn relation_modify(&mut self, _rel: &Relation, _mid: &dyn MiddleRead) -> Result<(), Error> {
        Ok(())
    }

    fn relation_delete(&mut self, _id: Osmid) -> Result<(), Error> {
        Ok(())
    }

    fn pending_way(&mut self, _id: Osmid, _mid: &dyn MiddleRead) -> Result<(), Error> {
        Ok(())
    }

    fn pending_relation(&mut self, _id: Osmid, _mid: &dyn MiddleRead) -> Result<(), Error> {
        Ok(())
    }

    fn pending_relation_stage1c(&mut self, _id: Osmid, _mid: &dyn MiddleRead) -> Result<(), Error> {
        Ok(())
    }

    fn take_marked_way_ids(&mut self) -> Vec<Osmid> {
        Vec::new()
    }

    fn reprocess_marked(&mut self, _mid: &dyn MiddleRead) -> Result<(), Error> {
        Ok(())
    }

    fn sync(&mut self) {}

    fn stop(&mut self) -> Result<Vec<MaintenanceTask>, Error> {
        Ok(Vec::new())
    }

    fn clone_for_worker(&self, _copy: &Arc<CopyThread>) -> Result<Box<dyn Output>, Error> {
        Ok(Box::new(NullOutput))
    }

    fn take_expire_tree(&mut self) -> Option<ExpireTiles> {
        None
    }

    fn merge_expire_tree(&mut self, _tree: ExpireTiles) {}
}
