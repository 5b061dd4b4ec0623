//! Extended well-known binary encoder/decoder
//!
//! EWKB is WKB with an optional SRID: the type word carries a flag bit and
//! the 4-byte SRID follows it. Data is written in native byte order with a
//! leading endian marker; the parser only accepts native-order input.

use thiserror::Error;

use crate::geom::{Data, Geometry, Point, PointList, Polygon};

const WKB_POINT: u32 = 1;
const WKB_LINE: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTI_POINT: u32 = 4;
const WKB_MULTI_LINE: u32 = 5;
const WKB_MULTI_POLYGON: u32 = 6;
const WKB_COLLECTION: u32 = 7;

/// SRID-presence flag in the type word.
const WKB_SRID: u32 = 0x2000_0000;

#[cfg(target_endian = "little")]
const ENDIAN: u8 = 1;
#[cfg(target_endian = "big")]
const ENDIAN: u8 = 0;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid EWKB geometry: {0}")]
    InvalidWkb(&'static str),
    #[error("invalid hex string")]
    InvalidHex,
}

fn push_u32(data: &mut Vec<u8>, value: u32) {
    data.extend_from_slice(&value.to_ne_bytes());
}

fn push_f64(data: &mut Vec<u8>, value: f64) {
    data.extend_from_slice(&value.to_ne_bytes());
}

/// Write the endian marker and type word. An SRID is only written for
/// top-level geometries; sub-geometries of multi/collection pass 0.
fn write_header(data: &mut Vec<u8>, type_: u32, srid: i32) {
    data.push(ENDIAN);
    if srid != 0 {
        push_u32(data, type_ | WKB_SRID);
        push_u32(data, srid as u32);
    } else {
        push_u32(data, type_);
    }
}

fn write_point(data: &mut Vec<u8>, point: &Point, srid: i32) {
    write_header(data, WKB_POINT, srid);
    push_f64(data, point.x);
    push_f64(data, point.y);
}

fn write_points(data: &mut Vec<u8>, points: &PointList) {
    push_u32(data, points.len() as u32);
    for point in points {
        push_f64(data, point.x);
        push_f64(data, point.y);
    }
}

fn write_linestring(data: &mut Vec<u8>, line: &PointList, srid: i32) {
    write_header(data, WKB_LINE, srid);
    write_points(data, line);
}

fn write_polygon(data: &mut Vec<u8>, polygon: &Polygon, srid: i32) {
    write_header(data, WKB_POLYGON, srid);
    push_u32(data, (polygon.inners.len() + 1) as u32);
    write_points(data, &polygon.outer);
    for ring in &polygon.inners {
        write_points(data, ring);
    }
}

fn write_multipoint(data: &mut Vec<u8>, points: &[Point], srid: i32) {
    write_header(data, WKB_MULTI_POINT, srid);
    push_u32(data, points.len() as u32);
    for point in points {
        write_point(data, point, 0);
    }
}

fn write_multilinestring(data: &mut Vec<u8>, lines: &[PointList], srid: i32) {
    write_header(data, WKB_MULTI_LINE, srid);
    push_u32(data, lines.len() as u32);
    for line in lines {
        write_linestring(data, line, 0);
    }
}

fn write_multipolygon(data: &mut Vec<u8>, polygons: &[Polygon], srid: i32) {
    write_header(data, WKB_MULTI_POLYGON, srid);
    push_u32(data, polygons.len() as u32);
    for polygon in polygons {
        write_polygon(data, polygon, 0);
    }
}

fn write_collection(data: &mut Vec<u8>, members: &[Geometry], srid: i32) {
    write_header(data, WKB_COLLECTION, srid);
    push_u32(data, members.len() as u32);
    for member in members {
        write_data(data, &member.data, 0);
    }
}

fn write_data(data: &mut Vec<u8>, geom: &Data, srid: i32) {
    match geom {
        Data::Null => (),
        Data::Point(p) => write_point(data, p, srid),
        Data::Linestring(l) => write_linestring(data, l, srid),
        Data::Polygon(p) => write_polygon(data, p, srid),
        Data::Multipoint(p) => write_multipoint(data, p, srid),
        Data::Multilinestring(l) => write_multilinestring(data, l, srid),
        Data::Multipolygon(p) => write_multipolygon(data, p, srid),
        Data::Collection(c) => write_collection(data, c, srid),
    }
}

/// Encode a geometry as EWKB.
///
/// With `ensure_multi` a singular point/linestring/polygon is wrapped in
/// the corresponding multi-geometry of length 1, so that a table column
/// declared as a multi type accepts it. A null geometry encodes to an
/// empty byte string.
pub fn encode(geom: &Geometry, ensure_multi: bool) -> Vec<u8> {
    let mut data = Vec::new();
    let srid = geom.srid;

    if ensure_multi {
        match &geom.data {
            Data::Point(p) => {
                write_header(&mut data, WKB_MULTI_POINT, srid);
                push_u32(&mut data, 1);
                write_point(&mut data, p, 0);
                return data;
            }
            Data::Linestring(l) => {
                write_header(&mut data, WKB_MULTI_LINE, srid);
                push_u32(&mut data, 1);
                write_linestring(&mut data, l, 0);
                return data;
            }
            Data::Polygon(p) => {
                write_header(&mut data, WKB_MULTI_POLYGON, srid);
                push_u32(&mut data, 1);
                write_polygon(&mut data, p, 0);
                return data;
            }
            _ => (),
        }
    }

    write_data(&mut data, &geom.data, srid);
    data
}

/// Parser over a byte slice.
///
/// Any declared length is checked against an upper bound derived from the
/// input size (a point takes 16 bytes), so a corrupt length field can
/// never make us allocate more than the input could possibly hold.
struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
    max_length: u32,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Parser<'a> {
        Parser {
            data,
            pos: 0,
            max_length: (data.len() / 16) as u32,
        }
    }

    fn check_bytes(&self, bytes: usize) -> Result<(), Error> {
        if self.data.len() - self.pos < bytes {
            return Err(Error::InvalidWkb("incomplete"));
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        self.check_bytes(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        self.check_bytes(4)?;
        let v = u32::from_ne_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn read_length(&mut self) -> Result<u32, Error> {
        let length = self.read_u32()?;
        if length > self.max_length {
            return Err(Error::InvalidWkb("length too large"));
        }
        Ok(length)
    }

    /// Read the endian marker and type word. `srid` is filled for
    /// top-level geometries; sub-geometries must not carry their own SRID.
    fn read_header(&mut self, srid: Option<&mut i32>) -> Result<u32, Error> {
        if self.read_u8()? != ENDIAN {
            return Err(Error::InvalidWkb("non-native byte order"));
        }
        let mut type_ = self.read_u32()?;
        if type_ & WKB_SRID != 0 {
            let Some(srid) = srid else {
                return Err(Error::InvalidWkb("SRID set in geometry of collection"));
            };
            type_ &= !WKB_SRID;
            *srid = self.read_u32()? as i32;
        }
        Ok(type_)
    }

    fn read_point(&mut self) -> Result<Point, Error> {
        self.check_bytes(16)?;
        let x = f64::from_ne_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        let y = f64::from_ne_bytes(self.data[self.pos + 8..self.pos + 16].try_into().unwrap());
        self.pos += 16;
        Ok(Point { x, y })
    }

    fn read_point_list(&mut self, min_points: u32) -> Result<PointList, Error> {
        let num_points = self.read_length()?;
        if num_points < min_points {
            return Err(Error::InvalidWkb("not enough points"));
        }
        let mut points = Vec::with_capacity(num_points as usize);
        for _ in 0..num_points {
            points.push(self.read_point()?);
        }
        Ok(points)
    }

    fn read_polygon(&mut self) -> Result<Polygon, Error> {
        let num_rings = self.read_length()?;
        if num_rings == 0 {
            return Err(Error::InvalidWkb("polygon without rings"));
        }
        let outer = self.read_point_list(4)?;
        let mut inners = Vec::with_capacity(num_rings as usize - 1);
        for _ in 1..num_rings {
            inners.push(self.read_point_list(4)?);
        }
        Ok(Polygon { outer, inners })
    }

    fn read_sub_header(&mut self, expected: u32, what: &'static str) -> Result<(), Error> {
        let type_ = self.read_header(None)?;
        if type_ != expected {
            return Err(Error::InvalidWkb(what));
        }
        Ok(())
    }

    fn read_geometry(&mut self, top_level: bool) -> Result<Geometry, Error> {
        let mut srid = 0;
        let type_ = self.read_header(top_level.then_some(&mut srid))?;

        let data = match type_ {
            WKB_POINT => Data::Point(self.read_point()?),
            WKB_LINE => Data::Linestring(self.read_point_list(2)?),
            WKB_POLYGON => Data::Polygon(self.read_polygon()?),
            WKB_MULTI_POINT => {
                let num = self.read_length()?;
                let mut points = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    self.read_sub_header(WKB_POINT, "multipoint with non-point member")?;
                    points.push(self.read_point()?);
                }
                if points.is_empty() {
                    Data::Null
                } else {
                    Data::Multipoint(points)
                }
            }
            WKB_MULTI_LINE => {
                let num = self.read_length()?;
                let mut lines = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    self.read_sub_header(WKB_LINE, "multilinestring with non-line member")?;
                    lines.push(self.read_point_list(2)?);
                }
                if lines.is_empty() {
                    Data::Null
                } else {
                    Data::Multilinestring(lines)
                }
            }
            WKB_MULTI_POLYGON => {
                let num = self.read_length()?;
                let mut polygons = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    self.read_sub_header(WKB_POLYGON, "multipolygon with non-polygon member")?;
                    polygons.push(self.read_polygon()?);
                }
                if polygons.is_empty() {
                    Data::Null
                } else {
                    Data::Multipolygon(polygons)
                }
            }
            WKB_COLLECTION => {
                let num = self.read_length()?;
                let mut members = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    // Members have their own full header but no SRID.
                    members.push(self.read_geometry(false)?);
                }
                if members.is_empty() {
                    Data::Null
                } else {
                    Data::Collection(members)
                }
            }
            _ => return Err(Error::InvalidWkb("unknown geometry type")),
        };

        Ok(Geometry { srid, data })
    }
}

/// Decode EWKB. Empty input and empty multi-geometries decode to the null
/// geometry; any leftover bytes after the top-level geometry are an error.
pub fn decode(data: &[u8]) -> Result<Geometry, Error> {
    if data.is_empty() {
        return Ok(Geometry::null());
    }

    let mut parser = Parser::new(data);
    let geom = parser.read_geometry(true)?;
    if parser.pos != data.len() {
        return Err(Error::InvalidWkb("extra data at end"));
    }
    Ok(geom)
}

const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

/// Hex-encode bytes, upper case, as expected inside COPY text.
pub fn encode_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push(HEX_CHARS[(b >> 4) as usize] as char);
        out.push(HEX_CHARS[(b & 0xf) as usize] as char);
    }
    out
}

fn decode_hex_char(c: u8) -> Result<u8, Error> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(Error::InvalidHex),
    }
}

/// Decode a hex string; odd length or non-hex characters are errors.
pub fn decode_hex(hex: &str) -> Result<Vec<u8>, Error> {
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidHex);
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        out.push((decode_hex_char(pair[0])? << 4) | decode_hex_char(pair[1])?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::SRID_WGS84;

    fn point(x: f64, y: f64) -> Point {
        Point::new(x, y)
    }

    #[test]
    fn encode_point_with_srid() {
        let geom = Geometry::new(Data::Point(point(3.14, 2.17)), 42);
        let wkb = encode(&geom, false);
        assert_eq!(
            "01010000202A0000001F85EB51B81E0940AE47E17A14AE0140",
            encode_hex(&wkb)
        );

        let back = decode(&wkb).unwrap();
        assert_eq!(geom, back);
        assert_eq!(42, back.srid);
    }

    #[test]
    fn round_trip() {
        let geoms = vec![
            Geometry::new(Data::Point(point(1.5, -2.5)), SRID_WGS84),
            Geometry::new(
                Data::Linestring(vec![point(0.0, 0.0), point(1.0, 1.0), point(2.0, 0.5)]),
                3857,
            ),
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
            ),
            Geometry::new(Data::Multipoint(vec![point(1.0, 2.0), point(3.0, 4.0)]), 42),
            Geometry::new(
                Data::Multilinestring(vec![
                    vec![point(0.0, 0.0), point(1.0, 0.0)],
                    vec![point(2.0, 2.0), point(3.0, 3.0)],
                ]),
                SRID_WGS84,
            ),
            Geometry::new(
                Data::Collection(vec![
                    Geometry::new(Data::Point(point(1.0, 1.0)), 0),
                    Geometry::new(Data::Linestring(vec![point(0.0, 0.0), point(1.0, 1.0)]), 0),
                ]),
                SRID_WGS84,
            ),
        ];

        for geom in geoms {
            let wkb = encode(&geom, false);
            assert_eq!(geom, decode(&wkb).unwrap(), "{}", geom.type_name());
        }
    }

    #[test]
    fn ensure_multi() {
        let geom = Geometry::new(Data::Point(point(1.0, 2.0)), SRID_WGS84);
        let wkb = encode(&geom, true);
        let back = decode(&wkb).unwrap();
        assert_eq!(
            Geometry::new(Data::Multipoint(vec![point(1.0, 2.0)]), SRID_WGS84),
            back
        );

        // already-multi geometries pass through unchanged
        let multi = Geometry::new(Data::Multipoint(vec![point(1.0, 2.0)]), SRID_WGS84);
        assert_eq!(encode(&multi, true), encode(&multi, false));
    }

    #[test]
    fn null_encodes_empty() {
        assert!(encode(&Geometry::null(), false).is_empty());
        assert!(encode(&Geometry::null(), true).is_empty());
        assert!(decode(b"").unwrap().is_null());
    }

    #[test]
    fn empty_multi_decodes_to_null() {
        let mut wkb = Vec::new();
        write_header(&mut wkb, WKB_MULTI_POINT, SRID_WGS84);
        push_u32(&mut wkb, 0);
        assert!(decode(&wkb).unwrap().is_null());
    }

    #[test]
    fn truncated_input() {
        let geom = Geometry::new(Data::Linestring(vec![point(0.0, 0.0), point(1.0, 1.0)]), 0);
        let wkb = encode(&geom, false);
        for len in 1..wkb.len() {
            assert!(decode(&wkb[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn extra_data_rejected() {
        let geom = Geometry::new(Data::Point(point(1.0, 2.0)), SRID_WGS84);
        let mut wkb = encode(&geom, false);
        wkb.push(0);
        assert_eq!(Err(Error::InvalidWkb("extra data at end")), decode(&wkb));
    }

    #[test]
    fn length_bomb_rejected() {
        // A linestring declaring 2^31 points in a 100-byte buffer.
        let mut wkb = Vec::new();
        write_header(&mut wkb, WKB_LINE, 0);
        push_u32(&mut wkb, 1 << 31);
        wkb.resize(100, 0);
        assert_eq!(Err(Error::InvalidWkb("length too large")), decode(&wkb));
    }

    #[test]
    fn srid_in_collection_member_rejected() {
        let mut wkb = Vec::new();
        write_header(&mut wkb, WKB_COLLECTION, SRID_WGS84);
        push_u32(&mut wkb, 1);
        // member with its own SRID is a parse error
        write_point(&mut wkb, &point(1.0, 2.0), SRID_WGS84);
        assert_eq!(
            Err(Error::InvalidWkb("SRID set in geometry of collection")),
            decode(&wkb)
        );
    }

    #[test]
    fn wrong_endian_rejected() {
        let geom = Geometry::new(Data::Point(point(1.0, 2.0)), SRID_WGS84);
        let mut wkb = encode(&geom, false);
        wkb[0] ^= 1;
        assert_eq!(Err(Error::InvalidWkb("non-native byte order")), decode(&wkb));
    }

    #[test]
    fn polygon_ring_too_short() {
        let mut wkb = Vec::new();
        write_header(&mut wkb, WKB_POLYGON, 0);
        push_u32(&mut wkb, 1);
        write_points(
            &mut wkb,
            &vec![point(0.0, 0.0), point(1.0, 0.0), point(0.0, 0.0)],
        );
        assert_eq!(Err(Error::InvalidWkb("not enough points")), decode(&wkb));
    }

    #[test]
    fn hex_codec() {
        let data = vec![0x00, 0x12, 0xab, 0xff];
        let hex = encode_hex(&data);
        assert_eq!("0012ABFF", hex);
        assert_eq!(data, decode_hex(&hex).unwrap());
        assert_eq!(data, decode_hex("0012abff").unwrap());

        assert_eq!(Err(Error::InvalidHex), decode_hex("012"));
        assert_eq!(Err(Error::InvalidHex), decode_hex("zz"));
    }
}
