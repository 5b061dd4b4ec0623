//! Flat node file
//!
//! Node locations stored in a single file directly indexed by node id:
//! one 8-byte record of two fixed-point coordinates per node. Unwritten
//! ranges stay sparse on disk and read back as absent. Coordinates are
//! shifted by +180° so that an all-zero record means "no node here";
//! negative ids are not representable in this store.

use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::geom::Point;
use crate::middle::Error;
use crate::osm::Osmid;

/// Bytes per node record: two 4-byte coordinates.
const RECORD_SIZE: u64 = 8;

/// Node location store backed by a flat file.
pub struct FlatNodeStore {
    file: File,
    map: Option<Mmap>,
    /// File length in bytes, tracked so reads past the end can be
    /// answered without touching the file.
    len: u64,
    /// Fixed-point scale of the stored coordinates.
    scale: i32,
    /// Offset added to scaled coordinates so 0 can mark an empty
    /// record: +180 degrees.
    offset: i64,
}

impl FlatNodeStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path, scale: i32) -> Result<FlatNodeStore, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let mut store = FlatNodeStore {
            file,
            map: None,
            len,
            scale,
            offset: 180 * i64::from(scale),
        };
        store.remap()?;
        Ok(store)
    }

    fn coord_to_bytes(&self, coord: f64) -> [u8; 4] {
        let scaled = (coord * f64::from(self.scale)).round() as i64;
        ((scaled + self.offset) as u32).to_le_bytes()
    }

    fn bytes_to_coord(&self, bytes: [u8; 4]) -> f64 {
        (i64::from(u32::from_le_bytes(bytes)) - self.offset) as f64 / f64::from(self.scale)
    }

    fn remap(&mut self) -> Result<(), Error> {
        self.map = if self.len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&self.file)? })
        };
        Ok(())
    }

    /// Store a node location. Only non-negative ids fit the file layout.
    pub fn set(&mut self, id: Osmid, lon: f64, lat: f64) -> Result<(), Error> {
        self.write_record(id, self.coord_to_bytes(lon), self.coord_to_bytes(lat))
    }

    /// Clear a node location (update mode).
    pub fn remove(&mut self, id: Osmid) -> Result<(), Error> {
        if id >= 0 && (id as u64 + 1) * RECORD_SIZE <= self.len {
            self.write_record(id, [0; 4], [0; 4])?;
        }
        Ok(())
    }

    fn write_record(&mut self, id: Osmid, lon: [u8; 4], lat: [u8; 4]) -> Result<(), Error> {
        if id < 0 {
            return Err(Error::NegativeId(id));
        }
        let offset = id as u64 * RECORD_SIZE;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&lon)?;
        self.file.write_all(&lat)?;
        self.len = self.len.max(offset + RECORD_SIZE);
        Ok(())
    }

    /// Flush writes and refresh the read mapping. Called when the input
    /// switches from nodes to ways.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.file.flush()?;
        self.remap()
    }

    /// Read a node location. Gaps and ids past the end of the file are
    /// absent, not errors. Records written after the last remap are
    /// outside the mapping and read with a positioned read instead.
    pub fn get(&self, id: Osmid) -> Option<Point> {
        if id < 0 {
            return None;
        }
        let offset = id as u64 * RECORD_SIZE;
        if offset + RECORD_SIZE > self.len {
            return None;
        }

        let mut record = [0u8; RECORD_SIZE as usize];
        let mapped = self
            .map
            .as_ref()
            .filter(|map| offset as usize + RECORD_SIZE as usize <= map.len());
        match mapped {
            Some(map) => {
                record.copy_from_slice(&map[offset as usize..offset as usize + 8]);
            }
            None => {
                self.file.read_exact_at(&mut record, offset).ok()?;
            }
        }

        let lon_bytes: [u8; 4] = record[0..4].try_into().unwrap();
        let lat_bytes: [u8; 4] = record[4..8].try_into().unwrap();
        if lon_bytes == [0; 4] && lat_bytes == [0; 4] {
            return None;
        }
        Some(Point::new(
            self.bytes_to_coord(lon_bytes),
            self.bytes_to_coord(lat_bytes),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::options::DEFAULT_SCALE;

    fn open_store(dir: &tempfile::TempDir) -> FlatNodeStore {
        FlatNodeStore::open(&dir.path().join("nodes.bin"), DEFAULT_SCALE).unwrap()
    }

    #[test]
    fn set_flush_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);

        store.set(10, 2.35, 48.85).unwrap();
        store.set(1000, -62.8363074, 17.9031745).unwrap();
        store.flush().unwrap();

        let p = store.get(10).unwrap();
        assert!((p.x - 2.35).abs() < 1e-6);
        assert!((p.y - 48.85).abs() < 1e-6);

        let p = store.get(1000).unwrap();
        assert!((p.x - -62.8363074).abs() < 1e-6);
        assert!((p.y - 17.9031745).abs() < 1e-6);

        // gaps between written records are absent
        assert!(store.get(11).is_none());
        assert!(store.get(999).is_none());
        // beyond the end of the file as well
        assert!(store.get(1001).is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.bin");
        {
            let mut store = FlatNodeStore::open(&path, DEFAULT_SCALE).unwrap();
            store.set(5, 1.0, 2.0).unwrap();
            store.flush().unwrap();
        }
        let store = FlatNodeStore::open(&path, DEFAULT_SCALE).unwrap();
        let p = store.get(5).unwrap();
        assert!((p.x - 1.0).abs() < 1e-6);
        assert!((p.y - 2.0).abs() < 1e-6);
    }

    #[test]
    fn zero_coordinates_are_not_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.set(1, 0.0, 0.0).unwrap();
        store.flush().unwrap();

        let p = store.get(1).unwrap();
        assert_eq!(Point::new(0.0, 0.0), p);
    }

    #[test]
    fn remove_clears_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.set(1, 1.0, 1.0).unwrap();
        store.remove(1).unwrap();
        store.flush().unwrap();
        assert!(store.get(1).is_none());
    }

    #[test]
    fn negative_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        assert!(matches!(
            store.set(-1, 1.0, 1.0),
            Err(Error::NegativeId(-1))
        ));
        assert!(store.get(-1).is_none());
    }
}
