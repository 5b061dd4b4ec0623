//! In-memory middle
//!
//! Object storage uses two levels: a fixed top-level array of block
//! slots, each lazily filled with a dense block once the first id in its
//! range arrives. Negative ids are handled by offsetting the block
//! index, so editor-local data works the same as uploaded data.

use log::warn;

use crate::geom::Point;
use crate::middle::{Error, Middle, MiddleRead, RelEntry, WayEntry};
use crate::osm::{Member, Osmid, Tags};

/// Id bits covered by the way/relation caches: ids in ±2³³.
const OBJECT_ID_BITS: u32 = 34;
/// Ways/relations per block.
const OBJECT_BLOCK_SHIFT: u32 = 14;

/// Id bits covered by the node store: ids in ±2³⁵.
const NODE_ID_BITS: u32 = 36;
/// Node locations per block.
const NODE_BLOCK_SHIFT: u32 = 16;

/// Two-level sparse array indexed by OSM id.
struct BlockCache<T> {
    blocks: Vec<Option<Box<[Option<T>]>>>,
}

impl<T> BlockCache<T> {
    fn new() -> BlockCache<T> {
        let num_blocks = 1usize << (OBJECT_ID_BITS - OBJECT_BLOCK_SHIFT);
        let mut blocks = Vec::with_capacity(num_blocks);
        blocks.resize_with(num_blocks, || None);
        BlockCache { blocks }
    }

    /// Block and in-block index for an id; the block offset makes room
    /// for negative ids in the lower half of the array.
    fn index(id: Osmid) -> Option<(usize, usize)> {
        let limit = 1i64 << (OBJECT_ID_BITS - 1);
        if id < -limit || id >= limit {
            return None;
        }
        let block = ((id >> OBJECT_BLOCK_SHIFT) + (1 << (OBJECT_ID_BITS - 1 - OBJECT_BLOCK_SHIFT)))
            as usize;
        let offset = (id & ((1 << OBJECT_BLOCK_SHIFT) - 1)) as usize;
        Some((block, offset))
    }

    fn set(&mut self, id: Osmid, entry: T) -> bool {
        let Some((block, offset)) = Self::index(id) else {
            return false;
        };
        let block = self.blocks[block].get_or_insert_with(|| {
            let mut v = Vec::new();
            v.resize_with(1 << OBJECT_BLOCK_SHIFT, || None);
            v.into_boxed_slice()
        });
        block[offset] = Some(entry);
        true
    }

    fn get(&self, id: Osmid) -> Option<&T> {
        let (block, offset) = Self::index(id)?;
        self.blocks[block].as_ref()?[offset].as_ref()
    }

    fn remove(&mut self, id: Osmid) {
        if let Some((block, offset)) = Self::index(id) {
            if let Some(block) = self.blocks[block].as_mut() {
                block[offset] = None;
            }
        }
    }
}

/// Sentinel marking an unset node slot. No valid decimicro longitude
/// reaches it.
const EMPTY: i32 = i32::MIN;

/// Packed node location, fixed-point degrees. Half the memory of an
/// `Option<(f64, f64)>` per node, which matters with billions of them.
#[derive(Clone, Copy)]
struct PackedLoc {
    lon: i32,
    lat: i32,
}

/// Specialised two-level array for node locations.
pub(crate) struct NodeStore {
    blocks: Vec<Option<Box<[PackedLoc]>>>,
    /// Fixed-point scale of the packed coordinates.
    scale: i32,
}

impl NodeStore {
    pub(crate) fn new(scale: i32) -> NodeStore {
        let num_blocks = 1usize << (NODE_ID_BITS - NODE_BLOCK_SHIFT);
        let mut blocks = Vec::with_capacity(num_blocks);
        blocks.resize_with(num_blocks, || None);
        NodeStore { blocks, scale }
    }

    fn index(id: Osmid) -> Option<(usize, usize)> {
        let limit = 1i64 << (NODE_ID_BITS - 1);
        if id < -limit || id >= limit {
            return None;
        }
        let block =
            ((id >> NODE_BLOCK_SHIFT) + (1 << (NODE_ID_BITS - 1 - NODE_BLOCK_SHIFT))) as usize;
        let offset = (id & ((1 << NODE_BLOCK_SHIFT) - 1)) as usize;
        Some((block, offset))
    }

    pub(crate) fn set(&mut self, id: Osmid, lon: f64, lat: f64) -> bool {
        let Some((block, offset)) = Self::index(id) else {
            return false;
        };
        let block = self.blocks[block].get_or_insert_with(|| {
            vec![PackedLoc { lon: EMPTY, lat: EMPTY }; 1 << NODE_BLOCK_SHIFT].into_boxed_slice()
        });
        block[offset] = PackedLoc {
            lon: (lon * f64::from(self.scale)).round() as i32,
            lat: (lat * f64::from(self.scale)).round() as i32,
        };
        true
    }

    pub(crate) fn get(&self, id: Osmid) -> Option<Point> {
        let (block, offset) = Self::index(id)?;
        let loc = self.blocks[block].as_ref()?[offset];
        if loc.lon == EMPTY {
            return None;
        }
        Some(Point::new(
            f64::from(loc.lon) / f64::from(self.scale),
            f64::from(loc.lat) / f64::from(self.scale),
        ))
    }

    pub(crate) fn remove(&mut self, id: Osmid) {
        if let Some((block, offset)) = Self::index(id) {
            if let Some(block) = self.blocks[block].as_mut() {
                block[offset] = PackedLoc { lon: EMPTY, lat: EMPTY };
            }
        }
    }
}

/// Middle keeping everything in memory. Fast for one-shot imports;
/// nothing survives the process, so it cannot serve append mode.
pub struct RamMiddle {
    nodes: NodeStore,
    ways: BlockCache<WayEntry>,
    rels: BlockCache<RelEntry>,
}

impl RamMiddle {
    pub fn new(scale: i32) -> RamMiddle {
        RamMiddle {
            nodes: NodeStore::new(scale),
            ways: BlockCache::new(),
            rels: BlockCache::new(),
        }
    }
}

impl MiddleRead for RamMiddle {
    fn node(&self, id: Osmid) -> Option<Point> {
        self.nodes.get(id)
    }

    fn way(&self, id: Osmid) -> Option<WayEntry> {
        self.ways.get(id).cloned()
    }

    fn relation(&self, id: Osmid) -> Option<RelEntry> {
        self.rels.get(id).cloned()
    }
}

/// Borrowed read-only view handed to worker threads.
struct RamReader<'a>(&'a RamMiddle);

impl MiddleRead for RamReader<'_> {
    fn node(&self, id: Osmid) -> Option<Point> {
        self.0.node(id)
    }

    fn way(&self, id: Osmid) -> Option<WayEntry> {
        self.0.way(id)
    }

    fn relation(&self, id: Osmid) -> Option<RelEntry> {
        self.0.relation(id)
    }
}

impl Middle for RamMiddle {
    fn put_node(&mut self, id: Osmid, lon: f64, lat: f64) -> Result<(), Error> {
        if !self.nodes.set(id, lon, lat) {
            warn!("node id {id} outside cacheable range, ignored");
        }
        Ok(())
    }

    fn put_way(&mut self, id: Osmid, tags: Tags, nodes: Vec<Osmid>) -> Result<(), Error> {
        if !self.ways.set(id, WayEntry { tags, nodes }) {
            warn!("way id {id} outside cacheable range, ignored");
        }
        Ok(())
    }

    fn put_relation(&mut self, id: Osmid, tags: Tags, members: Vec<Member>) -> Result<(), Error> {
        if !self.rels.set(id, RelEntry { tags, members }) {
            warn!("relation id {id} outside cacheable range, ignored");
        }
        Ok(())
    }

    fn delete_node(&mut self, id: Osmid) -> Result<(), Error> {
        self.nodes.remove(id);
        Ok(())
    }

    fn delete_way(&mut self, id: Osmid) -> Result<(), Error> {
        self.ways.remove(id);
        Ok(())
    }

    fn delete_relation(&mut self, id: Osmid) -> Result<(), Error> {
        self.rels.remove(id);
        Ok(())
    }

    fn as_read(&self) -> &dyn MiddleRead {
        self
    }

    fn query_handle(&self) -> Result<Box<dyn MiddleRead + Send + '_>, Error> {
        Ok(Box::new(RamReader(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DEFAULT_SCALE;

    fn ram_middle() -> RamMiddle {
        RamMiddle::new(DEFAULT_SCALE)
    }

    #[test]
    fn node_round_trip() {
        let mut middle = ram_middle();
        middle.put_node(42, 2.35, 48.85).unwrap();

        let p = middle.node(42).unwrap();
        assert!((p.x - 2.35).abs() < 1e-6);
        assert!((p.y - 48.85).abs() < 1e-6);

        assert_eq!(None, middle.node(43));
    }

    #[test]
    fn second_put_wins() {
        let mut middle = ram_middle();
        middle.put_node(1, 1.0, 1.0).unwrap();
        middle.put_node(1, 2.0, 2.0).unwrap();

        let p = middle.node(1).unwrap();
        assert!((p.x - 2.0).abs() < 1e-6);

        middle
            .put_way(7, Tags::new(), vec![1, 2, 3])
            .unwrap();
        middle
            .put_way(7, Tags::new(), vec![4, 5])
            .unwrap();
        assert_eq!(vec![4, 5], middle.way(7).unwrap().nodes);
    }

    #[test]
    fn negative_ids() {
        let mut middle = ram_middle();
        middle.put_node(-1, -62.83, 17.90).unwrap();
        middle.put_node(1, 2.35, 48.85).unwrap();

        let p = middle.node(-1).unwrap();
        assert!((p.x - -62.83).abs() < 1e-6);
        assert!((p.y - 17.90).abs() < 1e-6);

        // the positive twin is a different slot
        let p = middle.node(1).unwrap();
        assert!((p.x - 2.35).abs() < 1e-6);

        middle.put_way(-7, Tags::new(), vec![-1, 1]).unwrap();
        assert_eq!(vec![-1, 1], middle.way(-7).unwrap().nodes);
    }

    #[test]
    fn node_list_skips_missing() {
        let mut middle = ram_middle();
        middle.put_node(1, 0.0, 0.0).unwrap();
        middle.put_node(3, 1.0, 1.0).unwrap();

        let points = middle.node_list(&[1, 2, 3]);
        assert_eq!(2, points.len());
    }

    #[test]
    fn delete_clears_entry() {
        let mut middle = ram_middle();
        middle.put_node(1, 0.0, 0.0).unwrap();
        middle.delete_node(1).unwrap();
        assert_eq!(None, middle.node(1));

        let mut tags = Tags::new();
        tags.insert("type", "multipolygon");
        middle
            .put_relation(
                5,
                tags,
                vec![Member {
                    ref_: 7,
                    role: String::from("outer"),
                    type_: crate::osm::OsmType::Way,
                }],
            )
            .unwrap();
        assert!(middle.relation(5).is_some());
        middle.delete_relation(5).unwrap();
        assert!(middle.relation(5).is_none());
    }

    #[test]
    fn out_of_range_id_ignored() {
        let mut middle = ram_middle();
        middle.put_node(1 << 40, 0.0, 0.0).unwrap();
        assert_eq!(None, middle.node(1 << 40));
    }

    #[test]
    fn query_handle_sees_same_data() {
        let mut middle = ram_middle();
        middle.put_node(1, 1.5, 2.5).unwrap();

        let reader = middle.query_handle().unwrap();
        assert!(reader.node(1).is_some());
        assert!(reader.node(2).is_none());
    }
}
