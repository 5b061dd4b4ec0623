//! Operations on geometry values
//!
//! All operations treat the null geometry as identity where that makes
//! sense and return null otherwise. Nothing here panics on bad data; the
//! only panics are SRID precondition violations, which are programmer
//! errors.

use crate::geom::{Data, Geometry, Point, PointList, Polygon, SRID_WGS84};
use crate::projection::Reprojection;

/// Euclidean distance between two points.
pub fn distance(p1: Point, p2: Point) -> f64 {
    let dx = p1.x - p2.x;
    let dy = p1.y - p2.y;
    (dx * dx + dy * dy).sqrt()
}

/// Point at fraction `frac` of the way from `p2` to `p1`.
pub fn interpolate(p1: Point, p2: Point, frac: f64) -> Point {
    Point {
        x: frac * (p1.x - p2.x) + p2.x,
        y: frac * (p1.y - p2.y) + p2.y,
    }
}

fn ring_area(ring: &PointList) -> f64 {
    let mut total = 0.0;
    for pair in ring.windows(2) {
        total += pair[0].x * pair[1].y - pair[1].x * pair[0].y;
    }
    (total * 0.5).abs()
}

fn polygon_area(polygon: &Polygon) -> f64 {
    ring_area(&polygon.outer) - polygon.inners.iter().map(ring_area).sum::<f64>()
}

/// Planar area. Only polygons and multipolygons have one; everything else
/// is 0. Collections sum the area of their members.
pub fn area(geom: &Geometry) -> f64 {
    let total = match &geom.data {
        Data::Polygon(p) => polygon_area(p),
        Data::Multipolygon(polygons) => polygons.iter().map(polygon_area).sum(),
        Data::Collection(members) => members.iter().map(area).sum(),
        _ => 0.0,
    };
    total.abs()
}

/// WGS84 semi-major axis, used for areas on the spheroid.
const SPHEROID_RADIUS: f64 = 6378137.0;

fn spherical_ring_area(ring: &PointList) -> f64 {
    let mut total = 0.0;
    for pair in ring.windows(2) {
        total += (pair[1].x - pair[0].x).to_radians()
            * (2.0 + pair[0].y.to_radians().sin() + pair[1].y.to_radians().sin());
    }
    (total * SPHEROID_RADIUS * SPHEROID_RADIUS / 2.0).abs()
}

fn spherical_polygon_area(polygon: &Polygon) -> f64 {
    spherical_ring_area(&polygon.outer)
        - polygon.inners.iter().map(spherical_ring_area).sum::<f64>()
}

/// Area in square metres on the spheroid.
///
/// # Panics
///
/// The geometry must be in WGS84 (SRID 4326); anything else is a
/// programmer error.
pub fn spherical_area(geom: &Geometry) -> f64 {
    assert!(
        geom.srid == SRID_WGS84,
        "spherical_area() called on geometry with SRID {}",
        geom.srid
    );

    let total = match &geom.data {
        Data::Polygon(p) => spherical_polygon_area(p),
        Data::Multipolygon(polygons) => polygons.iter().map(spherical_polygon_area).sum(),
        _ => 0.0,
    };
    total.abs()
}

fn line_length(line: &PointList) -> f64 {
    line.windows(2).map(|pair| distance(pair[0], pair[1])).sum()
}

/// Length of linestrings and multilinestrings; 0 for everything else.
pub fn length(geom: &Geometry) -> f64 {
    match &geom.data {
        Data::Linestring(line) => line_length(line),
        Data::Multilinestring(lines) => lines.iter().map(line_length).sum(),
        _ => 0.0,
    }
}

/// Centroid accumulator: weighted sum of positions.
#[derive(Default)]
struct Accum {
    x: f64,
    y: f64,
    weight: f64,
}

impl Accum {
    fn add(&mut self, p: Point, weight: f64) {
        self.x += p.x * weight;
        self.y += p.y * weight;
        self.weight += weight;
    }

    fn result(&self) -> Point {
        if self.weight == 0.0 {
            // degenerate input
            return Point::default();
        }
        Point {
            x: self.x / self.weight,
            y: self.y / self.weight,
        }
    }
}

fn accumulate_points(acc: &mut Accum, points: &[Point]) {
    for p in points {
        acc.add(*p, 1.0);
    }
}

fn accumulate_line(acc: &mut Accum, line: &PointList) {
    for pair in line.windows(2) {
        let mid = interpolate(pair[0], pair[1], 0.5);
        acc.add(mid, distance(pair[0], pair[1]));
    }
}

fn ring_centroid(ring: &PointList) -> (Point, f64) {
    let mut a2 = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for pair in ring.windows(2) {
        let cross = pair[0].x * pair[1].y - pair[1].x * pair[0].y;
        a2 += cross;
        cx += (pair[0].x + pair[1].x) * cross;
        cy += (pair[0].y + pair[1].y) * cross;
    }
    if a2 == 0.0 {
        return (Point::default(), 0.0);
    }
    (
        Point {
            x: cx / (3.0 * a2),
            y: cy / (3.0 * a2),
        },
        (a2 * 0.5).abs(),
    )
}

fn accumulate_polygon(acc: &mut Accum, polygon: &Polygon) {
    let (c, a) = ring_centroid(&polygon.outer);
    acc.add(c, a);
    for inner in &polygon.inners {
        let (c, a) = ring_centroid(inner);
        acc.add(c, -a);
    }
}

/// Centroid as a point geometry in the same SRID. Null input gives null;
/// degenerate input (zero length or area) gives the origin.
pub fn centroid(geom: &Geometry) -> Geometry {
    let mut acc = Accum::default();
    accumulate_centroid(&mut acc, geom, geom.dimension());
    match geom.data {
        Data::Null => Geometry::null(),
        _ => Geometry::new(Data::Point(acc.result()), geom.srid),
    }
}

fn accumulate_centroid(acc: &mut Accum, geom: &Geometry, dimension: u32) {
    match &geom.data {
        Data::Null => (),
        Data::Point(p) => acc.add(*p, 1.0),
        Data::Multipoint(points) => accumulate_points(acc, points),
        Data::Linestring(line) => accumulate_line(acc, line),
        Data::Multilinestring(lines) => {
            for line in lines {
                accumulate_line(acc, line);
            }
        }
        Data::Polygon(p) => accumulate_polygon(acc, p),
        Data::Multipolygon(polygons) => {
            for p in polygons {
                accumulate_polygon(acc, p);
            }
        }
        Data::Collection(members) => {
            // only members of the highest dimension count
            for member in members {
                if member.dimension() == dimension && !member.is_null() {
                    accumulate_centroid(acc, member, dimension);
                }
            }
        }
    }
}

fn reverse_ring(ring: &PointList) -> PointList {
    ring.iter().rev().copied().collect()
}

fn reverse_polygon(polygon: &Polygon) -> Polygon {
    Polygon {
        outer: reverse_ring(&polygon.outer),
        inners: polygon.inners.iter().map(reverse_ring).collect(),
    }
}

/// Reverse the vertex order within every component.
pub fn reverse(geom: &Geometry) -> Geometry {
    let data = match &geom.data {
        Data::Null => Data::Null,
        Data::Point(p) => Data::Point(*p),
        Data::Linestring(line) => Data::Linestring(reverse_ring(line)),
        Data::Polygon(p) => Data::Polygon(reverse_polygon(p)),
        Data::Multipoint(points) => Data::Multipoint(points.clone()),
        Data::Multilinestring(lines) => {
            Data::Multilinestring(lines.iter().map(reverse_ring).collect())
        }
        Data::Multipolygon(polygons) => {
            Data::Multipolygon(polygons.iter().map(reverse_polygon).collect())
        }
        Data::Collection(members) => Data::Collection(members.iter().map(reverse).collect()),
    };
    Geometry::new(data, geom.srid)
}

/// Split one linestring into pieces no longer than `split_at`, appending
/// them to `output`.
fn split_linestring(line: &PointList, split_at: f64, output: &mut Vec<PointList>) {
    if line.is_empty() {
        return;
    }
    let mut dist = 0.0;
    let mut prev_pt = line[0];
    output.push(vec![prev_pt]);

    for &this_pt in &line[1..] {
        let delta = distance(prev_pt, this_pt);

        if dist + delta > split_at {
            // split the current segment into as many parts as needed to
            // keep each piece below split_at
            let splits = ((dist + delta) / split_at).floor() as usize;
            let mut ipoint = this_pt;
            for j in 0..splits {
                let frac = ((j + 1) as f64 * split_at - dist) / delta;
                ipoint = interpolate(this_pt, prev_pt, frac);
                if frac != 0.0 {
                    output.last_mut().unwrap().push(ipoint);
                }
                output.push(vec![ipoint]);
            }
            if this_pt == ipoint {
                dist = 0.0;
                prev_pt = this_pt;
                continue;
            }
            dist = distance(this_pt, ipoint);
        } else {
            dist += delta;
        }

        output.last_mut().unwrap().push(this_pt);
        prev_pt = this_pt;
    }

    if output.last().map(Vec::len).unwrap_or(0) <= 1 {
        output.pop();
    }
}

/// Split every segment longer than `max_segment_length` into equal pieces.
/// The result is always a multilinestring; input other than linestring or
/// multilinestring gives null.
pub fn segmentize(geom: &Geometry, max_segment_length: f64) -> Geometry {
    let mut lines: Vec<PointList> = Vec::new();
    match &geom.data {
        Data::Linestring(line) => split_linestring(line, max_segment_length, &mut lines),
        Data::Multilinestring(input) => {
            for line in input {
                split_linestring(line, max_segment_length, &mut lines);
            }
        }
        _ => return Geometry::null(),
    }
    Geometry::new(Data::Multilinestring(lines), geom.srid)
}

/// Perpendicular distance from `p` to the line through `a` and `b`.
fn point_segment_distance(p: Point, a: Point, b: Point) -> f64 {
    let base = distance(a, b);
    if base == 0.0 {
        return distance(p, a);
    }
    ((b.x - a.x) * (a.y - p.y) - (a.x - p.x) * (b.y - a.y)).abs() / base
}

fn douglas_peucker(line: &[Point], tolerance: f64, out: &mut PointList) {
    if line.len() < 2 {
        out.extend_from_slice(line);
        return;
    }
    let first = line[0];
    let last = line[line.len() - 1];

    let mut max_dist = 0.0;
    let mut max_idx = 0;
    for (i, &p) in line.iter().enumerate().take(line.len() - 1).skip(1) {
        let d = point_segment_distance(p, first, last);
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }

    if max_dist > tolerance {
        douglas_peucker(&line[..=max_idx], tolerance, out);
        out.pop();
        douglas_peucker(&line[max_idx..], tolerance, out);
    } else {
        out.push(first);
        out.push(last);
    }
}

/// Douglas-Peucker simplification. Works on linestrings only; any other
/// geometry type gives null.
pub fn simplify(geom: &Geometry, tolerance: f64) -> Geometry {
    let Data::Linestring(line) = &geom.data else {
        return Geometry::null();
    };

    let mut simplified = PointList::new();
    douglas_peucker(line, tolerance, &mut simplified);
    simplified.dedup();
    if simplified.len() < 2 {
        return Geometry::null();
    }
    Geometry::new(Data::Linestring(simplified), geom.srid)
}

const NOCONN: usize = usize::MAX;

struct Connection<'a> {
    left: usize,
    line: Option<&'a PointList>,
    right: usize,
}

/// Append the points of an iterator to `linestring`, skipping the first
/// one when the linestring already ends with it.
fn add_points_to_linestring<'a, I: Iterator<Item = &'a Point>>(linestring: &mut PointList, it: I) {
    let mut it = it.peekable();
    if !linestring.is_empty() {
        it.next();
    }
    for p in it {
        linestring.push(*p);
    }
}

/// Merge the members of a multilinestring end-to-end as far as possible,
/// reversing members where needed. A linestring passes through unchanged,
/// any other type gives null.
pub fn line_merge(geom: &Geometry) -> Geometry {
    if let Data::Linestring(_) = &geom.data {
        return geom.clone();
    }
    let Data::Multilinestring(input) = &geom.data else {
        return Geometry::null();
    };

    // Make a list of all endpoints...
    struct Endpoint {
        c: Point,
        n: usize,
        is_front: bool,
    }

    let mut endpoints: Vec<Endpoint> = Vec::with_capacity(input.len() * 2);
    // ...and a list of connections.
    let mut conns: Vec<Connection> = Vec::with_capacity(input.len());

    for line in input {
        if line.is_empty() {
            continue;
        }
        endpoints.push(Endpoint {
            c: line[0],
            n: conns.len(),
            is_front: true,
        });
        endpoints.push(Endpoint {
            c: line[line.len() - 1],
            n: conns.len(),
            is_front: false,
        });
        conns.push(Connection {
            left: NOCONN,
            line: Some(line),
            right: NOCONN,
        });
    }

    endpoints.sort_by(|a, b| {
        (a.c.x, a.c.y, a.n, a.is_front)
            .partial_cmp(&(b.c.x, b.c.y, b.n, b.is_front))
            .unwrap()
    });

    // Fill the connection list from pairs of identical endpoints.
    let mut i = 0;
    while i + 1 < endpoints.len() {
        if endpoints[i].c != endpoints[i + 1].c {
            i += 1;
            continue;
        }
        let previd = endpoints[i].n;
        let ptid = endpoints[i + 1].n;
        if endpoints[i].is_front {
            conns[previd].left = ptid;
        } else {
            conns[previd].right = ptid;
        }
        if endpoints[i + 1].is_front {
            conns[ptid].left = previd;
        } else {
            conns[ptid].right = previd;
        }
        i += 2;
    }

    let mut merged: Vec<PointList> = Vec::new();

    // Use all open ends as starting points and walk along the
    // connections, marking each used member as done.
    let mut done = 0;
    let todo = conns.len();
    for i in 0..todo {
        if conns[i].line.is_none() || (conns[i].left != NOCONN && conns[i].right != NOCONN) {
            continue; // already done or not the beginning of a chain
        }

        let mut linestring = PointList::new();
        let mut prev = NOCONN;
        let mut cur = i;
        loop {
            let line = conns[cur].line.unwrap();
            let forward = conns[cur].left == prev;
            prev = cur;
            let next = if forward {
                add_points_to_linestring(&mut linestring, line.iter());
                conns[cur].right
            } else {
                add_points_to_linestring(&mut linestring, line.iter().rev());
                conns[cur].left
            };
            conns[prev].line = None;
            done += 1;
            if next == NOCONN {
                break;
            }
            cur = next;
        }
        merged.push(linestring);
    }

    // Any members left over form closed loops without an open end.
    if done < todo {
        for i in 0..todo {
            if conns[i].line.is_none() {
                continue;
            }

            let mut linestring = PointList::new();
            let mut prev = conns[i].left;
            let mut cur = i;
            loop {
                let line = conns[cur].line.unwrap();
                let forward = conns[cur].left == prev
                    && (conns[conns[cur].left].line.is_none()
                        || conns[conns[cur].left].line.unwrap().last() == line.first());
                prev = cur;
                let next = if forward {
                    add_points_to_linestring(&mut linestring, line.iter());
                    conns[cur].right
                } else {
                    add_points_to_linestring(&mut linestring, line.iter().rev());
                    conns[cur].left
                };
                conns[prev].line = None;
                if next == i {
                    break;
                }
                cur = next;
            }
            merged.push(linestring);
        }
    }

    if merged.is_empty() {
        return Geometry::null();
    }
    Geometry::new(Data::Multilinestring(merged), geom.srid)
}

/// Reproject every point of a geometry from WGS84 to the target system.
///
/// # Panics
///
/// The input must be in WGS84 (SRID 4326).
pub fn transform(geom: &Geometry, projection: &Reprojection) -> Geometry {
    assert!(
        geom.srid == SRID_WGS84,
        "transform() called on geometry with SRID {}",
        geom.srid
    );

    let srid = projection.target_srid();
    Geometry::new(transform_data(&geom.data, projection), srid)
}

fn transform_points(points: &PointList, projection: &Reprojection) -> PointList {
    points.iter().map(|p| projection.reproject(*p)).collect()
}

fn transform_polygon(polygon: &Polygon, projection: &Reprojection) -> Polygon {
    Polygon {
        outer: transform_points(&polygon.outer, projection),
        inners: polygon
            .inners
            .iter()
            .map(|r| transform_points(r, projection))
            .collect(),
    }
}

fn transform_data(data: &Data, projection: &Reprojection) -> Data {
    match data {
        Data::Null => Data::Null,
        Data::Point(p) => Data::Point(projection.reproject(*p)),
        Data::Linestring(line) => Data::Linestring(transform_points(line, projection)),
        Data::Polygon(p) => Data::Polygon(transform_polygon(p, projection)),
        Data::Multipoint(points) => Data::Multipoint(transform_points(points, projection)),
        Data::Multilinestring(lines) => Data::Multilinestring(
            lines.iter().map(|l| transform_points(l, projection)).collect(),
        ),
        Data::Multipolygon(polygons) => Data::Multipolygon(
            polygons
                .iter()
                .map(|p| transform_polygon(p, projection))
                .collect(),
        ),
        Data::Collection(members) => Data::Collection(
            members
                .iter()
                .map(|m| Geometry::new(transform_data(&m.data, projection), 0))
                .collect(),
        ),
    }
}

/// Split a multi-geometry into its parts. Singular geometries end up as
/// the only element, null gives an empty vector. Without `split` the
/// geometry passes through whole.
pub fn split_multi(geom: Geometry, split: bool) -> Vec<Geometry> {
    if geom.is_null() {
        return Vec::new();
    }
    if !split || !geom.is_multi() {
        return vec![geom];
    }

    let srid = geom.srid;
    match geom.data {
        Data::Multipoint(points) => points
            .into_iter()
            .map(|p| Geometry::new(Data::Point(p), srid))
            .collect(),
        Data::Multilinestring(lines) => lines
            .into_iter()
            .map(|l| Geometry::new(Data::Linestring(l), srid))
            .collect(),
        Data::Multipolygon(polygons) => polygons
            .into_iter()
            .map(|p| Geometry::new(Data::Polygon(p), srid))
            .collect(),
        Data::Collection(members) => members
            .into_iter()
            .map(|mut m| {
                m.srid = srid;
                m
            })
            .collect(),
        _ => unreachable!(),
    }
}

/// The nth (1-based) sub-geometry, with the SRID of the input. Out of
/// range gives null; a singular geometry is its own first sub-geometry.
pub fn geometry_n(geom: &Geometry, n: usize) -> Geometry {
    if n < 1 || n > geom.num_geometries() {
        return Geometry::null();
    }
    let srid = geom.srid;
    match &geom.data {
        Data::Point(_) | Data::Linestring(_) | Data::Polygon(_) => geom.clone(),
        Data::Multipoint(points) => Geometry::new(Data::Point(points[n - 1]), srid),
        Data::Multilinestring(lines) => {
            Geometry::new(Data::Linestring(lines[n - 1].clone()), srid)
        }
        Data::Multipolygon(polygons) => Geometry::new(Data::Polygon(polygons[n - 1].clone()), srid),
        Data::Collection(members) => {
            let mut member = members[n - 1].clone();
            member.srid = srid;
            member
        }
        Data::Null => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f64, y: f64) -> Point {
        Point::new(x, y)
    }

    fn square_with_hole() -> Geometry {
        Geometry::new(
            Data::Polygon(Polygon {
                outer: vec![
                    point(0.0, 0.0),
                    point(3.0, 0.0),
                    point(3.0, 3.0),
                    point(0.0, 3.0),
                    point(0.0, 0.0),
                ],
                inners: vec![vec![
                    point(1.0, 1.0),
                    point(2.0, 1.0),
                    point(2.0, 2.0),
                    point(1.0, 2.0),
                    point(1.0, 1.0),
                ]],
            }),
            SRID_WGS84,
        )
    }

    #[test]
    fn distance_interpolate() {
        assert_eq!(5.0, distance(point(0.0, 0.0), point(3.0, 4.0)));
        assert_eq!(
            point(1.0, 1.0),
            interpolate(point(2.0, 2.0), point(0.0, 0.0), 0.5)
        );
        assert_eq!(
            point(0.0, 0.0),
            interpolate(point(2.0, 2.0), point(0.0, 0.0), 0.0)
        );
    }

    #[test]
    fn polygon_area_with_hole() {
        let geom = square_with_hole();
        assert_eq!(8.0, area(&geom));
        // non-polygons have no area
        let line = Geometry::new(
            Data::Linestring(vec![point(0.0, 0.0), point(1.0, 0.0)]),
            SRID_WGS84,
        );
        assert_eq!(0.0, area(&line));
    }

    #[test]
    fn area_reverse_invariant() {
        let geom = square_with_hole();
        let reversed = reverse(&geom);
        assert_eq!(area(&geom), area(&reversed));
        // double reverse is identity
        assert_eq!(geom, reverse(&reversed));
    }

    #[test]
    fn spherical_area_equator_square() {
        // a 1°×1° square at the equator is about 111.19 km on a side
        let geom = Geometry::new(
            Data::Polygon(Polygon {
                outer: vec![
                    point(0.0, 0.0),
                    point(1.0, 0.0),
                    point(1.0, 1.0),
                    point(0.0, 1.0),
                    point(0.0, 0.0),
                ],
                inners: vec![],
            }),
            SRID_WGS84,
        );
        let a = spherical_area(&geom);
        assert!((a - 1.2364e10).abs() < 1e8, "{a}");
    }

    #[test]
    #[should_panic]
    fn spherical_area_requires_wgs84() {
        let geom = Geometry::new(Data::Polygon(Polygon::default()), 3857);
        spherical_area(&geom);
    }

    #[test]
    fn line_length() {
        let line = Geometry::new(
            Data::Linestring(vec![point(0.0, 0.0), point(3.0, 4.0), point(3.0, 5.0)]),
            SRID_WGS84,
        );
        assert_eq!(6.0, length(&line));
        assert_eq!(0.0, length(&square_with_hole()));
    }

    #[test]
    fn centroid_multipoint() {
        let geom = Geometry::new(
            Data::Multipoint(vec![
                point(1.0, 0.0),
                point(1.0, 1.0),
                point(3.0, 2.0),
                point(3.0, 1.0),
            ]),
            SRID_WGS84,
        );
        assert_eq!(
            Geometry::new(Data::Point(point(2.0, 1.0)), SRID_WGS84),
            centroid(&geom)
        );
    }

    #[test]
    fn centroid_square() {
        let geom = Geometry::new(
            Data::Polygon(Polygon {
                outer: vec![
                    point(0.0, 0.0),
                    point(2.0, 0.0),
                    point(2.0, 2.0),
                    point(0.0, 2.0),
                    point(0.0, 0.0),
                ],
                inners: vec![],
            }),
            SRID_WGS84,
        );
        let c = centroid(&geom);
        assert_eq!(Geometry::new(Data::Point(point(1.0, 1.0)), SRID_WGS84), c);
    }

    #[test]
    fn centroid_degenerate() {
        let line = Geometry::new(
            Data::Linestring(vec![point(5.0, 5.0), point(5.0, 5.0)]),
            SRID_WGS84,
        );
        assert_eq!(
            Geometry::new(Data::Point(point(0.0, 0.0)), SRID_WGS84),
            centroid(&line)
        );
        assert!(centroid(&Geometry::null()).is_null());
    }

    #[test]
    fn segmentize_splits_long_segments() {
        let line = Geometry::new(
            Data::Linestring(vec![point(0.0, 0.0), point(3.0, 0.0)]),
            SRID_WGS84,
        );
        let result = segmentize(&line, 1.0);
        let Data::Multilinestring(lines) = &result.data else {
            panic!("expected multilinestring");
        };
        assert_eq!(3, lines.len());
        assert_eq!(vec![point(0.0, 0.0), point(1.0, 0.0)], lines[0]);
        assert_eq!(vec![point(1.0, 0.0), point(2.0, 0.0)], lines[1]);
        assert_eq!(vec![point(2.0, 0.0), point(3.0, 0.0)], lines[2]);

        // non-lines give null
        assert!(segmentize(&square_with_hole(), 1.0).is_null());
    }

    #[test]
    fn simplify_removes_collinear_points() {
        let line = Geometry::new(
            Data::Linestring(vec![
                point(0.0, 0.0),
                point(1.0, 0.01),
                point(2.0, -0.01),
                point(3.0, 0.0),
            ]),
            SRID_WGS84,
        );
        let result = simplify(&line, 0.1);
        assert_eq!(
            Geometry::new(
                Data::Linestring(vec![point(0.0, 0.0), point(3.0, 0.0)]),
                SRID_WGS84
            ),
            result
        );

        // keeps significant vertices
        let bend = Geometry::new(
            Data::Linestring(vec![point(0.0, 0.0), point(1.0, 1.0), point(2.0, 0.0)]),
            SRID_WGS84,
        );
        assert_eq!(bend, simplify(&bend, 0.1));

        // other types give null
        assert!(simplify(&square_with_hole(), 0.1).is_null());
    }

    #[test]
    fn line_merge_joins_segments() {
        let geom = Geometry::new(
            Data::Multilinestring(vec![
                vec![point(0.0, 0.0), point(1.0, 0.0)],
                vec![point(2.0, 0.0), point(1.0, 0.0)],
                vec![point(2.0, 0.0), point(3.0, 0.0)],
            ]),
            SRID_WGS84,
        );
        let merged = line_merge(&geom);
        assert_eq!(
            Geometry::new(
                Data::Multilinestring(vec![vec![
                    point(0.0, 0.0),
                    point(1.0, 0.0),
                    point(2.0, 0.0),
                    point(3.0, 0.0),
                ]]),
                SRID_WGS84
            ),
            merged
        );
    }

    #[test]
    fn line_merge_idempotent() {
        let geom = Geometry::new(
            Data::Multilinestring(vec![
                vec![point(0.0, 0.0), point(1.0, 0.0)],
                vec![point(2.0, 0.0), point(1.0, 0.0)],
                vec![point(5.0, 5.0), point(6.0, 6.0)],
            ]),
            SRID_WGS84,
        );
        let once = line_merge(&geom);
        let twice = line_merge(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn line_merge_closed_loop() {
        let geom = Geometry::new(
            Data::Multilinestring(vec![
                vec![point(0.0, 0.0), point(1.0, 0.0), point(1.0, 1.0)],
                vec![point(1.0, 1.0), point(0.0, 1.0), point(0.0, 0.0)],
            ]),
            SRID_WGS84,
        );
        let merged = line_merge(&geom);
        let Data::Multilinestring(lines) = &merged.data else {
            panic!("expected multilinestring");
        };
        assert_eq!(1, lines.len());
        assert_eq!(lines[0].first(), lines[0].last());

        // a linestring passes through, everything else is null
        let line = Geometry::new(
            Data::Linestring(vec![point(0.0, 0.0), point(1.0, 0.0)]),
            SRID_WGS84,
        );
        assert_eq!(line, line_merge(&line));
        assert!(line_merge(&square_with_hole()).is_null());
    }

    #[test]
    fn transform_to_mercator() {
        let geom = Geometry::new(Data::Point(point(180.0, 0.0)), SRID_WGS84);
        let projected = transform(&geom, &Reprojection::SphericalMercator);
        assert_eq!(3857, projected.srid);
        let Data::Point(p) = projected.data else {
            panic!("expected point");
        };
        assert!((p.x - 20037508.34).abs() < 1.0);
        assert!(p.y.abs() < 1e-9);
    }

    #[test]
    fn split_multi_components() {
        let geom = Geometry::new(
            Data::Multipoint(vec![point(1.0, 2.0), point(3.0, 4.0)]),
            SRID_WGS84,
        );
        let parts = split_multi(geom.clone(), true);
        assert_eq!(
            vec![
                Geometry::new(Data::Point(point(1.0, 2.0)), SRID_WGS84),
                Geometry::new(Data::Point(point(3.0, 4.0)), SRID_WGS84),
            ],
            parts
        );

        assert_eq!(vec![geom.clone()], split_multi(geom, false));
        assert!(split_multi(Geometry::null(), true).is_empty());
    }

    #[test]
    fn geometry_n_1based() {
        let geom = Geometry::new(
            Data::Multipoint(vec![point(1.0, 2.0), point(3.0, 4.0)]),
            SRID_WGS84,
        );
        assert_eq!(
            Geometry::new(Data::Point(point(1.0, 2.0)), SRID_WGS84),
            geometry_n(&geom, 1)
        );
        assert_eq!(
            Geometry::new(Data::Point(point(3.0, 4.0)), SRID_WGS84),
            geometry_n(&geom, 2)
        );
        assert!(geometry_n(&geom, 0).is_null());
        assert!(geometry_n(&geom, 3).is_null());

        let single = Geometry::new(Data::Point(point(1.0, 2.0)), SRID_WGS84);
        assert_eq!(single, geometry_n(&single, 1));
    }
}
