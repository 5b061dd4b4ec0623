//! Geometry construction from OSM topology
//!
//! Builders take node locations already resolved through the middle and
//! return a geometry, or the null geometry when the input is degenerate
//! (too few distinct points, unclosed rings, failed assembly). They never
//! fail with an error: a broken object in the input must not stop an
//! import.

use geo::{Contains, LineString};

use crate::geom::ops::line_merge;
use crate::geom::{Data, Geometry, Point, PointList, Polygon, SRID_WGS84};
use crate::osm::Node;

/// Drop consecutive duplicate points, the way node lists routinely
/// contain them.
fn collapse(points: &[Point]) -> PointList {
    let mut out: PointList = Vec::with_capacity(points.len());
    for &p in points {
        if out.last() != Some(&p) {
            out.push(p);
        }
    }
    out
}

/// Point geometry from a node.
pub fn create_point(node: &Node) -> Geometry {
    Geometry::new(
        Data::Point(Point::new(node.lon(), node.lat())),
        SRID_WGS84,
    )
}

/// Linestring from the located nodes of a way. Fewer than two distinct
/// points give null.
pub fn create_linestring(points: &[Point]) -> Geometry {
    let line = collapse(points);
    if line.len() < 2 {
        return Geometry::null();
    }
    Geometry::new(Data::Linestring(line), SRID_WGS84)
}

/// Polygon from the located nodes of a way. The way must be closed:
/// after collapsing, at least four points with first equal to last.
/// There are no inner rings; holes only exist via relations.
pub fn create_polygon(points: &[Point]) -> Geometry {
    let ring = collapse(points);
    if ring.len() < 4 || ring.first() != ring.last() {
        return Geometry::null();
    }
    Geometry::new(
        Data::Polygon(Polygon {
            outer: ring,
            inners: Vec::new(),
        }),
        SRID_WGS84,
    )
}

/// Multilinestring from several ways. Degenerate members are dropped;
/// no usable member gives null. With `force_multi` unset, a single
/// member comes back as a plain linestring.
pub fn create_multilinestring(ways: &[PointList], force_multi: bool) -> Geometry {
    let mut lines: Vec<PointList> = Vec::new();
    for way in ways {
        let line = collapse(way);
        if line.len() >= 2 {
            lines.push(line);
        }
    }

    match lines.len() {
        0 => Geometry::null(),
        1 if !force_multi => {
            Geometry::new(Data::Linestring(lines.pop().unwrap()), SRID_WGS84)
        }
        _ => Geometry::new(Data::Multilinestring(lines), SRID_WGS84),
    }
}

/// Multipoint from the located node members of a relation, in member
/// order. Empty input gives null.
pub fn create_multipoint(points: Vec<Point>) -> Geometry {
    if points.is_empty() {
        return Geometry::null();
    }
    Geometry::new(Data::Multipoint(points), SRID_WGS84)
}

/// Heterogeneous collection from relation members, in member order. The
/// caller builds the members (points from nodes, linestrings from ways)
/// and skips unlocatable ones; empty input gives null.
pub fn create_collection(members: Vec<Geometry>) -> Geometry {
    let members: Vec<Geometry> = members
        .into_iter()
        .filter(|m| !m.is_null())
        .map(|mut m| {
            m.srid = 0;
            m
        })
        .collect();
    if members.is_empty() {
        return Geometry::null();
    }
    Geometry::new(Data::Collection(members), SRID_WGS84)
}

fn to_geo_polygon(ring: &PointList) -> geo::Polygon<f64> {
    let coords: Vec<(f64, f64)> = ring.iter().map(|p| (p.x, p.y)).collect();
    geo::Polygon::new(LineString::from(coords), vec![])
}

/// Multipolygon assembly from the member ways of a relation.
///
/// Member ways are merged end-to-end into closed rings; rings are then
/// nested by containment: rings at even depth are outer rings, rings at
/// odd depth are holes of their immediate parent. The roles on the
/// members ("outer"/"inner") do not drive the assembly, the geometry
/// does, so mistagged and untagged rings come out right. Any leftover
/// open linestring makes the whole assembly invalid and the result null.
///
/// A single outer ring without siblings gives a plain polygon.
pub fn create_multipolygon(ways: &[PointList]) -> Geometry {
    let mut rings: Vec<PointList> = Vec::new();
    let mut open: Vec<PointList> = Vec::new();

    for way in ways {
        let line = collapse(way);
        if line.len() < 2 {
            continue;
        }
        if line.len() >= 4 && line.first() == line.last() {
            rings.push(line);
        } else {
            open.push(line);
        }
    }

    if !open.is_empty() {
        let merged = line_merge(&Geometry::new(Data::Multilinestring(open), SRID_WGS84));
        let Data::Multilinestring(lines) = merged.data else {
            return Geometry::null();
        };
        for line in lines {
            if line.len() >= 4 && line.first() == line.last() {
                rings.push(line);
            } else {
                // an unclosed piece is left, assembly failed
                return Geometry::null();
            }
        }
    }

    if rings.is_empty() {
        return Geometry::null();
    }

    // Nest rings by containment depth.
    let polygons: Vec<geo::Polygon<f64>> = rings.iter().map(to_geo_polygon).collect();
    let depth: Vec<usize> = rings
        .iter()
        .enumerate()
        .map(|(i, ring)| {
            let probe = geo::Point::new(ring[0].x, ring[0].y);
            polygons
                .iter()
                .enumerate()
                .filter(|(j, poly)| *j != i && poly.contains(&probe))
                .count()
        })
        .collect();

    let mut result: Vec<Polygon> = Vec::new();
    let mut outer_index: Vec<usize> = Vec::new();
    for (i, ring) in rings.iter().enumerate() {
        if depth[i] % 2 == 0 {
            outer_index.push(i);
            result.push(Polygon {
                outer: ring.clone(),
                inners: Vec::new(),
            });
        }
    }

    for (i, ring) in rings.iter().enumerate() {
        if depth[i] % 2 == 0 {
            continue;
        }
        // parent: the containing outer ring one level up
        let probe = geo::Point::new(ring[0].x, ring[0].y);
        let parent = outer_index
            .iter()
            .position(|&j| depth[j] == depth[i] - 1 && polygons[j].contains(&probe));
        match parent {
            Some(p) => result[p].inners.push(ring.clone()),
            None => return Geometry::null(),
        }
    }

    if result.len() == 1 {
        let polygon = result.pop().unwrap();
        return Geometry::new(Data::Polygon(polygon), SRID_WGS84);
    }
    Geometry::new(Data::Multipolygon(result), SRID_WGS84)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::ops::area;
    use crate::osm::coord_to_decimicro;

    fn point(x: f64, y: f64) -> Point {
        Point::new(x, y)
    }

    #[test]
    fn point_from_node() {
        let node = Node {
            id: 1,
            decimicro_lat: coord_to_decimicro(48.85),
            decimicro_lon: coord_to_decimicro(2.35),
            ..Default::default()
        };
        let geom = create_point(&node);
        let Data::Point(p) = geom.data else {
            panic!("expected point");
        };
        assert!((p.x - 2.35).abs() < 1e-9);
        assert!((p.y - 48.85).abs() < 1e-9);
    }

    #[test]
    fn linestring_collapses_duplicates() {
        let geom = create_linestring(&[
            point(0.0, 0.0),
            point(0.0, 0.0),
            point(1.0, 0.0),
            point(1.0, 0.0),
            point(2.0, 0.0),
        ]);
        assert_eq!(
            Geometry::new(
                Data::Linestring(vec![point(0.0, 0.0), point(1.0, 0.0), point(2.0, 0.0)]),
                SRID_WGS84
            ),
            geom
        );
    }

    #[test]
    fn degenerate_ways_give_null() {
        assert!(create_linestring(&[]).is_null());
        assert!(create_linestring(&[point(1.0, 1.0)]).is_null());
        assert!(create_linestring(&[point(1.0, 1.0), point(1.0, 1.0)]).is_null());

        // open ring
        assert!(create_polygon(&[point(0.0, 0.0), point(1.0, 0.0), point(1.0, 1.0)]).is_null());
        // too few points even though closed
        assert!(create_polygon(&[point(0.0, 0.0), point(1.0, 0.0), point(0.0, 0.0)]).is_null());
    }

    #[test]
    fn polygon_from_closed_way() {
        let geom = create_polygon(&[
            point(0.0, 0.0),
            point(2.0, 0.0),
            point(2.0, 2.0),
            point(0.0, 2.0),
            point(0.0, 0.0),
        ]);
        assert_eq!(4.0, area(&geom));
    }

    #[test]
    fn multilinestring_single_member() {
        let ways = vec![vec![point(0.0, 0.0), point(1.0, 0.0)]];
        let geom = create_multilinestring(&ways, false);
        assert_eq!("LINESTRING", geom.type_name());

        let geom = create_multilinestring(&ways, true);
        assert_eq!("MULTILINESTRING", geom.type_name());

        assert!(create_multilinestring(&[], false).is_null());
        assert!(create_multilinestring(&[vec![point(0.0, 0.0)]], true).is_null());
    }

    #[test]
    fn multipoint_in_member_order() {
        let geom = create_multipoint(vec![
            point(1.0, 0.0),
            point(1.0, 1.0),
            point(3.0, 2.0),
            point(3.0, 1.0),
        ]);
        assert_eq!(
            Geometry::new(
                Data::Multipoint(vec![
                    point(1.0, 0.0),
                    point(1.0, 1.0),
                    point(3.0, 2.0),
                    point(3.0, 1.0),
                ]),
                SRID_WGS84
            ),
            geom
        );
        assert!(create_multipoint(vec![]).is_null());
    }

    #[test]
    fn collection_filters_null_members() {
        let members = vec![
            Geometry::new(Data::Point(point(1.0, 1.0)), SRID_WGS84),
            Geometry::null(),
            create_linestring(&[point(0.0, 0.0), point(1.0, 0.0)]),
        ];
        let geom = create_collection(members);
        assert_eq!(2, geom.num_geometries());

        assert!(create_collection(vec![]).is_null());
        assert!(create_collection(vec![Geometry::null()]).is_null());
    }

    #[test]
    fn multipolygon_with_hole() {
        let outer = vec![
            point(0.0, 0.0),
            point(3.0, 0.0),
            point(3.0, 3.0),
            point(0.0, 3.0),
            point(0.0, 0.0),
        ];
        let inner = vec![
            point(1.0, 1.0),
            point(2.0, 1.0),
            point(2.0, 2.0),
            point(1.0, 2.0),
            point(1.0, 1.0),
        ];
        let geom = create_multipolygon(&[outer, inner]);
        let Data::Polygon(polygon) = &geom.data else {
            panic!("expected polygon, got {}", geom.type_name());
        };
        assert_eq!(1, polygon.inners.len());
        assert_eq!(8.0, area(&geom));
    }

    #[test]
    fn multipolygon_from_split_ways() {
        // a square outer ring split over two member ways
        let half1 = vec![point(0.0, 0.0), point(3.0, 0.0), point(3.0, 3.0)];
        let half2 = vec![point(3.0, 3.0), point(0.0, 3.0), point(0.0, 0.0)];
        let geom = create_multipolygon(&[half1, half2]);
        assert_eq!("POLYGON", geom.type_name());
        assert_eq!(9.0, area(&geom));
    }

    #[test]
    fn multipolygon_two_outers() {
        let a = vec![
            point(0.0, 0.0),
            point(1.0, 0.0),
            point(1.0, 1.0),
            point(0.0, 1.0),
            point(0.0, 0.0),
        ];
        let b = vec![
            point(5.0, 5.0),
            point(6.0, 5.0),
            point(6.0, 6.0),
            point(5.0, 6.0),
            point(5.0, 5.0),
        ];
        let geom = create_multipolygon(&[a, b]);
        assert_eq!("MULTIPOLYGON", geom.type_name());
        assert_eq!(2.0, area(&geom));
    }

    #[test]
    fn multipolygon_invalid_assembly() {
        // a dangling open way makes the assembly fail
        let ring = vec![
            point(0.0, 0.0),
            point(1.0, 0.0),
            point(1.0, 1.0),
            point(0.0, 1.0),
            point(0.0, 0.0),
        ];
        let dangling = vec![point(10.0, 10.0), point(11.0, 11.0)];
        assert!(create_multipolygon(&[ring, dangling]).is_null());
        assert!(create_multipolygon(&[]).is_null());
    }
}
