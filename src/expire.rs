//! Dirty-tile list generation
//!
//! Mutated geometries dirty the Web-Mercator tiles they touch, so a
//! renderer downstream knows what to re-render after an update. Dirty
//! tiles are collected in a quadtree over the tile grid at `max_zoom`:
//! four children per node plus a "complete" flag per quadrant, so a
//! fully dirtied quadrant needs no subtree. The tree is dumped to a
//! text file at the end and freed in the process.

use log::{info, warn};
use std::io::{self, Write};

use crate::ewkb;
use crate::geom::{Data, Geometry, Point, PointList, Polygon};
use crate::osm::Osmid;
use crate::projection::{Reprojection, HALF_EARTH_CIRCUMFERENCE};

/// Tiles of extra space to dirty either side of a changed feature.
const TILE_EXPIRY_LEEWAY: f64 = 0.1;

/// Bounding boxes wider or taller than this many metres expire only
/// their perimeter, not the full fill.
const MAX_BBOX: f64 = 20000.0;

#[derive(Default)]
struct Tile {
    complete: [bool; 4],
    sub: [Option<Box<Tile>>; 4],
}

fn sub2x(i: usize) -> u32 {
    (i >> 1) as u32
}

fn sub2y(i: usize) -> u32 {
    (i & 1) as u32
}

impl Tile {
    fn num_complete(&self) -> usize {
        self.complete.iter().filter(|c| **c).count()
    }

    /// Mark the tile (x, y) at `zoom` as dirty in the subtree rooted at
    /// `this_zoom`. Returns how many of the four quadrants are complete
    /// so the parent can collapse a fully dirty subtree.
    fn mark(&mut self, x: u32, y: u32, zoom: u32, this_zoom: u32) -> usize {
        let zoom_diff = zoom - this_zoom - 1;
        let sub = ((((x >> zoom_diff) & 1) << 1) | ((y >> zoom_diff) & 1)) as usize;

        if !self.complete[sub] {
            if zoom_diff == 0 {
                self.complete[sub] = true;
                self.sub[sub] = None;
            } else {
                let child = self.sub[sub].get_or_insert_with(Default::default);
                if child.mark(x, y, zoom, this_zoom + 1) >= 4 {
                    self.complete[sub] = true;
                    self.sub[sub] = None;
                }
            }
        }

        self.num_complete()
    }

    /// Structural OR with another tree. The other tree is consumed.
    fn merge(&mut self, other: Tile) -> usize {
        for (i, (other_complete, other_sub)) in other
            .complete
            .into_iter()
            .zip(other.sub.into_iter())
            .enumerate()
        {
            if other_complete {
                self.complete[i] = true;
                self.sub[i] = None;
            } else if !self.complete[i] {
                match (&mut self.sub[i], other_sub) {
                    (Some(mine), Some(theirs)) => {
                        if mine.merge(*theirs) >= 4 {
                            self.complete[i] = true;
                            self.sub[i] = None;
                        }
                    }
                    (slot @ None, Some(theirs)) => *slot = Some(theirs),
                    (_, None) => (),
                }
            }
        }

        self.num_complete()
    }

    /// Emit every dirty (zoom, x, y) between `min_zoom` and `max_zoom`.
    /// A quadrant present in the tree is an ancestor of a dirty tile and
    /// therefore dirty itself; a complete quadrant stands for all its
    /// descendants down to `max_zoom`.
    fn output<F: FnMut(u32, u32, u32)>(
        &self,
        x: u32,
        y: u32,
        this_zoom: u32,
        min_zoom: u32,
        max_zoom: u32,
        out: &mut F,
    ) {
        let sub_x = x << 1;
        let sub_y = y << 1;
        let child_zoom = this_zoom + 1;

        for i in 0..4 {
            let cx = sub_x + sub2x(i);
            let cy = sub_y + sub2y(i);
            if self.complete[i] {
                output_complete(cx, cy, child_zoom, min_zoom, max_zoom, out);
            } else if let Some(sub) = &self.sub[i] {
                if child_zoom >= min_zoom {
                    out(child_zoom, cx, cy);
                }
                sub.output(cx, cy, child_zoom, min_zoom, max_zoom, out);
            }
        }
    }
}

/// Emit a completely dirty tile and all its descendants down to
/// `max_zoom`.
fn output_complete<F: FnMut(u32, u32, u32)>(
    x: u32,
    y: u32,
    zoom: u32,
    min_zoom: u32,
    max_zoom: u32,
    out: &mut F,
) {
    if zoom >= min_zoom {
        out(zoom, x, y);
    }
    if zoom < max_zoom {
        for i in 0..4 {
            output_complete(
                (x << 1) + sub2x(i),
                (y << 1) + sub2y(i),
                zoom + 1,
                min_zoom,
                max_zoom,
                out,
            );
        }
    }
}

/// Tracker of tiles dirtied by mutated geometries.
pub struct ExpireTiles {
    max_zoom: u32,
    map_width: i32,
    projection: Reprojection,
    dirty: Option<Box<Tile>>,
}

impl ExpireTiles {
    /// Track dirty tiles at `max_zoom`. `projection` is the projection
    /// of the geometries fed in, i.e. the output table's.
    pub fn new(max_zoom: u32, projection: Reprojection) -> ExpireTiles {
        ExpireTiles {
            max_zoom,
            map_width: 1 << max_zoom,
            projection,
            dirty: None,
        }
    }

    fn expire_tile(&mut self, x: u32, y: u32) {
        if self.max_zoom == 0 {
            return;
        }
        self.dirty
            .get_or_insert_with(Default::default)
            .mark(x, y, self.max_zoom, 0);
    }

    fn normalise_tile_x(&self, x: i64) -> u32 {
        let width = i64::from(self.map_width);
        (((x % width) + width) % width) as u32
    }

    /// Expire the tiles a line crosses. Points are in the tracker's
    /// target projection. Lines crossing the date line wrap around.
    pub fn expire_line(&mut self, a: Point, b: Point) {
        let (mut x1, mut y1) = self.projection.target_to_tile(a, self.map_width);
        let (mut x2, mut y2) = self.projection.target_to_tile(b, self.map_width);

        // walk the line from left to right
        if x1 > x2 {
            std::mem::swap(&mut x1, &mut x2);
            std::mem::swap(&mut y1, &mut y2);
        }

        // wider than half the map: the line wraps around the date line
        if x2 - x1 > f64::from(self.map_width) / 2.0 {
            x1 += f64::from(self.map_width);
            std::mem::swap(&mut x1, &mut x2);
            std::mem::swap(&mut y1, &mut y2);
        }

        let x_len = x2 - x1;
        let y_len = y2 - y1;
        let hyp_len = (x_len * x_len + y_len * y_len).sqrt();
        let (x_step, y_step) = if hyp_len == 0.0 {
            (0.0, 0.0)
        } else {
            (x_len / hyp_len, y_len / hyp_len)
        };

        // interpolate points less than a tile width apart and dirty a
        // small box around each resulting sub-segment
        let mut step: f64 = 0.0;
        loop {
            let next_step = (step + 0.4).min(hyp_len);
            let sx1 = x1 + step * x_step;
            let sy1 = y1 + step * y_step;
            let sx2 = x1 + next_step * x_step;
            let mut sy2 = y1 + next_step * y_step;
            let mut sy1 = sy1;
            if sy1 > sy2 {
                std::mem::swap(&mut sy1, &mut sy2);
            }

            let x_from = (sx1 - TILE_EXPIRY_LEEWAY).floor() as i64;
            let x_to = (sx2 + TILE_EXPIRY_LEEWAY).floor() as i64;
            let y_from = ((sy1 - TILE_EXPIRY_LEEWAY).floor() as i64).max(0);
            let y_to = ((sy2 + TILE_EXPIRY_LEEWAY).floor() as i64)
                .min(i64::from(self.map_width) - 1);
            for x in x_from..=x_to {
                let norm_x = self.normalise_tile_x(x);
                for y in y_from..=y_to {
                    self.expire_tile(norm_x, y as u32);
                }
            }

            if next_step >= hyp_len {
                break;
            }
            step = next_step;
        }
    }

    /// Expire a single point.
    pub fn expire_point(&mut self, p: Point) {
        let merc = match self.projection {
            Reprojection::LatLong => crate::projection::lonlat_to_merc(p),
            Reprojection::SphericalMercator => p,
        };
        let _ = self.expire_bbox_merc(merc, merc);
    }

    /// Expire all tiles in a bounding box given in Mercator metres.
    /// Returns false when the box is too large and nothing was done.
    fn expire_bbox_merc(&mut self, min: Point, max: Point) -> bool {
        let width = max.x - min.x;
        let height = max.y - min.y;

        if width > HALF_EARTH_CIRCUMFERENCE + 1.0 {
            // crosses the date line, split in two
            let r1 = self.expire_bbox_merc(
                Point::new(-HALF_EARTH_CIRCUMFERENCE, min.y),
                Point::new(min.x, max.y),
            );
            let r2 = self.expire_bbox_merc(
                Point::new(max.x, min.y),
                Point::new(HALF_EARTH_CIRCUMFERENCE, max.y),
            );
            return r1 && r2;
        }

        if width > MAX_BBOX || height > MAX_BBOX {
            return false;
        }

        let proj = Reprojection::SphericalMercator;
        let (x1, y2) = proj.target_to_tile(Point::new(min.x, min.y), self.map_width);
        let (x2, y1) = proj.target_to_tile(Point::new(max.x, max.y), self.map_width);

        let x_from = (x1 - TILE_EXPIRY_LEEWAY).floor() as i64;
        let x_to = (x2 + TILE_EXPIRY_LEEWAY).floor() as i64;
        let y_from = (((y1 - TILE_EXPIRY_LEEWAY).floor() as i64)).max(0);
        let y_to = ((y2 + TILE_EXPIRY_LEEWAY).floor() as i64)
            .min(i64::from(self.map_width) - 1);

        for x in x_from..=x_to {
            let norm_x = self.normalise_tile_x(x);
            for y in y_from..=y_to {
                self.expire_tile(norm_x, y as u32);
            }
        }
        true
    }

    fn merc_point(&self, p: Point) -> Point {
        match self.projection {
            Reprojection::LatLong => crate::projection::lonlat_to_merc(p),
            Reprojection::SphericalMercator => p,
        }
    }

    /// Expire the tiles covered by a polygon ring: a fill over the
    /// ring's bounding box, or only the perimeter when the box is too
    /// large for a fill.
    pub fn expire_polygon(&mut self, ring: &PointList, osm_id: Osmid) {
        if ring.is_empty() {
            return;
        }

        let mut min = self.merc_point(ring[0]);
        let mut max = min;
        for p in &ring[1..] {
            let m = self.merc_point(*p);
            min.x = min.x.min(m.x);
            min.y = min.y.min(m.y);
            max.x = max.x.max(m.x);
            max.y = max.y.max(m.y);
        }

        if !self.expire_bbox_merc(min, max) {
            warn!(
                "large polygon ({:.0} x {:.0} metres, OSM ID {osm_id}), only expiring perimeter",
                max.x - min.x,
                max.y - min.y
            );
            self.expire_line_string(ring);
        }
    }

    fn expire_line_string(&mut self, line: &PointList) {
        match line.len() {
            0 => (),
            1 => self.expire_point(line[0]),
            _ => {
                for pair in line.windows(2) {
                    self.expire_line(pair[0], pair[1]);
                }
            }
        }
    }

    /// Expire everything a geometry touches.
    pub fn expire_geometry(&mut self, geom: &Geometry, osm_id: Osmid) {
        match &geom.data {
            Data::Null => (),
            Data::Point(p) => self.expire_point(*p),
            Data::Linestring(line) => self.expire_line_string(line),
            Data::Polygon(polygon) => self.expire_polygon_rings(polygon, osm_id),
            Data::Multipoint(points) => {
                for p in points {
                    self.expire_point(*p);
                }
            }
            Data::Multilinestring(lines) => {
                for line in lines {
                    self.expire_line_string(line);
                }
            }
            Data::Multipolygon(polygons) => {
                for polygon in polygons {
                    self.expire_polygon_rings(polygon, osm_id);
                }
            }
            Data::Collection(members) => {
                for member in members {
                    self.expire_geometry(member, osm_id);
                }
            }
        }
    }

    fn expire_polygon_rings(&mut self, polygon: &Polygon, osm_id: Osmid) {
        self.expire_polygon(&polygon.outer, osm_id);
        for inner in &polygon.inners {
            self.expire_polygon(inner, osm_id);
        }
    }

    /// Expire from a hex-free EWKB blob as stored in a geometry column.
    /// Corrupt blobs are logged and skipped.
    pub fn expire_from_ewkb(&mut self, wkb: &[u8], osm_id: Osmid) {
        match ewkb::decode(wkb) {
            Ok(geom) => self.expire_geometry(&geom, osm_id),
            Err(e) => warn!("cannot expire OSM ID {osm_id}: {e}"),
        }
    }

    /// Merge the dirty tiles of another tracker into this one. The other
    /// tracker is consumed.
    pub fn merge(&mut self, other: ExpireTiles) {
        assert_eq!(
            self.map_width, other.map_width,
            "cannot merge tile expiry sets of different zoom levels"
        );
        let Some(theirs) = other.dirty else {
            return;
        };
        match &mut self.dirty {
            Some(mine) => {
                mine.merge(*theirs);
            }
            None => self.dirty = Some(theirs),
        }
    }

    /// Run `out(zoom, x, y)` for every dirty tile between `min_zoom` and
    /// the tracker's maximum zoom. Consumes the tree.
    pub fn for_each_tile<F: FnMut(u32, u32, u32)>(mut self, min_zoom: u32, out: &mut F) {
        if let Some(dirty) = self.dirty.take() {
            if min_zoom == 0 {
                out(0, 0, 0);
            }
            dirty.output(0, 0, 0, min_zoom, self.max_zoom, out);
        }
    }

    /// Write the dirty-tile list as "z/x/y" lines. Consumes the tree.
    pub fn output_and_destroy<W: Write>(
        self,
        writer: &mut W,
        min_zoom: u32,
    ) -> io::Result<usize> {
        let mut count = 0usize;
        let mut error = None;
        self.for_each_tile(min_zoom, &mut |zoom, x, y| {
            if error.is_none() {
                if let Err(e) = writeln!(writer, "{zoom}/{x}/{y}") {
                    error = Some(e);
                } else {
                    count += 1;
                }
            }
        });
        match error {
            Some(e) => Err(e),
            None => {
                info!("wrote {count} entries to expired tiles list");
                Ok(count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn collect(expire: ExpireTiles, min_zoom: u32) -> BTreeSet<(u32, u32, u32)> {
        let mut tiles = BTreeSet::new();
        expire.for_each_tile(min_zoom, &mut |z, x, y| {
            tiles.insert((z, x, y));
        });
        tiles
    }

    fn merc(x: f64, y: f64) -> Point {
        Point::new(x, y)
    }

    #[test]
    fn point_dirties_tile_and_ancestors() {
        let mut expire = ExpireTiles::new(3, Reprojection::SphericalMercator);
        // world center: all four center tiles within leeway
        expire.expire_point(merc(0.0, 0.0));
        let tiles = collect(expire, 1);

        // at zoom 3 the four tiles around the center are dirty
        assert!(tiles.contains(&(3, 3, 3)));
        assert!(tiles.contains(&(3, 4, 4)));
        // ancestors are dirty too
        assert!(tiles.contains(&(2, 1, 1)));
        assert!(tiles.contains(&(1, 0, 0)));
        // nothing outside the center
        assert!(!tiles.contains(&(3, 0, 0)));
    }

    #[test]
    fn min_zoom_cuts_output() {
        let mut expire = ExpireTiles::new(3, Reprojection::SphericalMercator);
        expire.expire_point(merc(0.0, 0.0));
        let tiles = collect(expire, 3);
        assert!(tiles.iter().all(|(z, _, _)| *z == 3));
    }

    #[test]
    fn line_covers_crossed_tiles() {
        let mut expire = ExpireTiles::new(5, Reprojection::SphericalMercator);
        let quarter = HALF_EARTH_CIRCUMFERENCE / 2.0;
        expire.expire_line(merc(-quarter, 1000.0), merc(quarter, 1000.0));
        let tiles = collect(expire, 5);

        // the line runs at the equator across half the world: the whole
        // x range between the endpoints at tile row 15/16 is covered
        for x in 8..=24 {
            assert!(
                tiles.contains(&(5, x, 15)) || tiles.contains(&(5, x, 16)),
                "missing tile column {x}"
            );
        }
    }

    #[test]
    fn merge_is_commutative() {
        let build_a = || {
            let mut e = ExpireTiles::new(6, Reprojection::SphericalMercator);
            e.expire_point(merc(1000.0, 1000.0));
            e.expire_line(merc(-2000.0, 0.0), merc(2000.0, 500.0));
            e
        };
        let build_b = || {
            let mut e = ExpireTiles::new(6, Reprojection::SphericalMercator);
            e.expire_point(merc(-5_000_000.0, 4_000_000.0));
            e
        };

        let mut ab = build_a();
        ab.merge(build_b());
        let mut ba = build_b();
        ba.merge(build_a());

        assert_eq!(collect(ab, 2), collect(ba, 2));
    }

    #[test]
    fn merge_empty_is_identity() {
        let mut a = ExpireTiles::new(4, Reprojection::SphericalMercator);
        a.expire_point(merc(0.0, 0.0));
        let reference = {
            let mut r = ExpireTiles::new(4, Reprojection::SphericalMercator);
            r.expire_point(merc(0.0, 0.0));
            collect(r, 0)
        };

        a.merge(ExpireTiles::new(4, Reprojection::SphericalMercator));
        assert_eq!(reference, collect(a, 0));
    }

    #[test]
    fn complete_quadrant_expands_to_descendants() {
        let mut expire = ExpireTiles::new(2, Reprojection::SphericalMercator);
        // dirty all 4 zoom-2 tiles of the north-west zoom-1 tile
        for (x, y) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            expire.expire_tile(x, y);
        }
        let tiles = collect(expire, 1);
        assert!(tiles.contains(&(1, 0, 0)));
        assert!(tiles.contains(&(2, 0, 0)));
        assert!(tiles.contains(&(2, 1, 1)));
        assert_eq!(5, tiles.len());
    }

    #[test]
    fn output_format() {
        let mut expire = ExpireTiles::new(1, Reprojection::SphericalMercator);
        expire.expire_tile(0, 1);
        let mut out = Vec::new();
        let count = expire.output_and_destroy(&mut out, 1).unwrap();
        assert_eq!(1, count);
        assert_eq!("1/0/1\n", String::from_utf8(out).unwrap());
    }

    #[test]
    fn geometry_expiry_from_ewkb() {
        use crate::geom::{Data, Geometry};

        let mut expire = ExpireTiles::new(8, Reprojection::SphericalMercator);
        let geom = Geometry::new(Data::Point(merc(0.0, 0.0)), 3857);
        expire.expire_from_ewkb(&ewkb::encode(&geom, false), 1);
        assert!(!collect(expire, 8).is_empty());

        // corrupt EWKB is skipped, not fatal
        let mut expire = ExpireTiles::new(8, Reprojection::SphericalMercator);
        expire.expire_from_ewkb(&[0xff, 0x00], 1);
        assert!(collect(expire, 8).is_empty());
    }
}
