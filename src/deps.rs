//! Dependency tracking between OSM objects
//!
//! When a change file touches a node, every way using that node must be
//! re-emitted; when it touches a way, every relation using that way must
//! be. The manager collects those parent ids during ingest and hands
//! them out once, sorted, for the pending stages.

use rustc_hash::FxHashSet;

use crate::middle::{BackRefs, Error};
use crate::osm::Osmid;

#[derive(Default)]
pub struct DependencyManager {
    pending_ways: FxHashSet<Osmid>,
    pending_rels: FxHashSet<Osmid>,
}

impl DependencyManager {
    pub fn new() -> DependencyManager {
        DependencyManager::default()
    }

    /// A node was added, modified or deleted. Must be called *after* the
    /// object reached the object store, the reverse queries run against
    /// it.
    pub fn node_changed(&mut self, id: Osmid, store: &dyn BackRefs) -> Result<(), Error> {
        for way_id in store.ways_using_node(id)? {
            self.pending_ways.insert(way_id);
        }
        Ok(())
    }

    /// A way was added, modified or deleted.
    pub fn way_changed(&mut self, id: Osmid, store: &dyn BackRefs) -> Result<(), Error> {
        if self.pending_ways.contains(&id) {
            // parents were already collected when the way became pending
            return Ok(());
        }
        for rel_id in store.relations_using_way(id)? {
            self.pending_rels.insert(rel_id);
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_ways.is_empty() || !self.pending_rels.is_empty()
    }

    /// The pending way ids, sorted and unique. Clears the set.
    pub fn drain_pending_way_ids(&mut self) -> Vec<Osmid> {
        Self::drain(&mut self.pending_ways)
    }

    /// The pending relation ids, sorted and unique. Clears the set.
    pub fn drain_pending_relation_ids(&mut self) -> Vec<Osmid> {
        Self::drain(&mut self.pending_rels)
    }

    fn drain(set: &mut FxHashSet<Osmid>) -> Vec<Osmid> {
        let mut ids: Vec<Osmid> = set.drain().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    /// Reverse references held in plain maps, standing in for the slim
    /// middle.
    #[derive(Default)]
    struct MapRefs {
        node_to_ways: FxHashMap<Osmid, Vec<Osmid>>,
        way_to_rels: FxHashMap<Osmid, Vec<Osmid>>,
    }

    impl BackRefs for MapRefs {
        fn ways_using_node(&self, id: Osmid) -> Result<Vec<Osmid>, Error> {
            Ok(self.node_to_ways.get(&id).cloned().unwrap_or_default())
        }

        fn relations_using_way(&self, id: Osmid) -> Result<Vec<Osmid>, Error> {
            Ok(self.way_to_rels.get(&id).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn pending_propagation() {
        // way 20 references node 1, relation 30 references way 20
        let mut refs = MapRefs::default();
        refs.node_to_ways.insert(1, vec![20]);
        refs.way_to_rels.insert(20, vec![30]);

        let mut deps = DependencyManager::new();
        assert!(!deps.has_pending());

        deps.node_changed(1, &refs).unwrap();
        assert!(deps.has_pending());
        assert_eq!(vec![20], deps.drain_pending_way_ids());

        deps.way_changed(20, &refs).unwrap();
        assert_eq!(vec![30], deps.drain_pending_relation_ids());
        assert!(!deps.has_pending());
    }

    #[test]
    fn drain_is_sorted_unique() {
        let mut refs = MapRefs::default();
        refs.node_to_ways.insert(1, vec![300, 100]);
        refs.node_to_ways.insert(2, vec![100, 200]);

        let mut deps = DependencyManager::new();
        deps.node_changed(1, &refs).unwrap();
        deps.node_changed(2, &refs).unwrap();

        assert_eq!(vec![100, 200, 300], deps.drain_pending_way_ids());
        // drained: a second drain is empty
        assert!(deps.drain_pending_way_ids().is_empty());
    }

    #[test]
    fn pending_way_suppresses_rel_scan() {
        // a way already pending was itself changed, so its parent
        // relations are already covered by the change file
        let mut refs = MapRefs::default();
        refs.node_to_ways.insert(1, vec![20]);
        refs.way_to_rels.insert(20, vec![30]);
        refs.way_to_rels.insert(21, vec![31]);

        let mut deps = DependencyManager::new();
        deps.node_changed(1, &refs).unwrap();
        deps.way_changed(20, &refs).unwrap();
        deps.way_changed(21, &refs).unwrap();

        assert_eq!(vec![20], deps.drain_pending_way_ids());
        assert_eq!(vec![31], deps.drain_pending_relation_ids());
    }

    #[test]
    fn unknown_ids_are_harmless() {
        let refs = MapRefs::default();
        let mut deps = DependencyManager::new();
        deps.node_changed(99, &refs).unwrap();
        deps.way_changed(99, &refs).unwrap();
        assert!(!deps.has_pending());
    }
}
