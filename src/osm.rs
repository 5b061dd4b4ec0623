use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of an OSM object, unique within its type.
///
/// Ids may be negative for editor-local data that was never uploaded.
pub type Osmid = i64;

/// Relations with more members than this are dropped by the driver. The
/// limit matches the smallint member-index column used by common database
/// schemas.
pub const MAX_RELATION_MEMBERS: usize = 32767;

/// Ordered list of key/value tags.
///
/// Order is preserved so that output rows are reproducible. Duplicate keys
/// coming from the wire are removed on insert, last value wins.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    pub fn new() -> Tags {
        Tags(Vec::new())
    }

    /// Insert a tag, replacing the value in place if the key is present.
    pub fn insert(&mut self, key: &str, value: &str) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(kv) => kv.1 = value.to_string(),
            None => self.0.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for Tags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Tags {
        let mut tags = Tags::new();
        for (k, v) in iter {
            tags.insert(&k, &v);
        }
        tags
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = &'a (String, String);
    type IntoIter = std::slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

pub fn coord_to_decimicro(coord: f64) -> i32 {
    (coord * 1e7).round() as i32
}

pub fn decimicro_to_coord(decimicro: i32) -> f64 {
    f64::from(decimicro) * 1e-7
}

/// Node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// Node id
    pub id: Osmid,
    /// Latitude in decimicro degrees (10⁻⁷ degrees).
    pub decimicro_lat: i32,
    /// Longitude in decimicro degrees (10⁻⁷ degrees).
    pub decimicro_lon: i32,
    /// Tags
    pub tags: Tags,
}

impl Node {
    /// Returns the latitude of the node in degrees.
    pub fn lat(&self) -> f64 {
        decimicro_to_coord(self.decimicro_lat)
    }
    /// Returns the longitude of the node in degrees.
    pub fn lon(&self) -> f64 {
        decimicro_to_coord(self.decimicro_lon)
    }

    /// A location is valid when it is inside the WGS84 range.
    pub fn location_valid(&self) -> bool {
        self.lon() >= -180.0 && self.lon() <= 180.0 && self.lat() >= -90.0 && self.lat() <= 90.0
    }
}

/// Way
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Way {
    /// Way id
    pub id: Osmid,
    /// List of ordered node references
    pub nodes: Vec<Osmid>,
    /// Tags
    pub tags: Tags,
}

impl Way {
    /// A way is closed when it has at least four node references and the
    /// first and last one are the same.
    pub fn is_closed(&self) -> bool {
        self.nodes.len() >= 4 && self.nodes.first() == self.nodes.last()
    }
}

/// Type of an OSM object or relation member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum OsmType {
    #[default]
    #[serde(rename = "node")]
    Node,
    #[serde(rename = "way")]
    Way,
    #[serde(rename = "relation")]
    Relation,
}

impl OsmType {
    /// One-letter code used in per-type database columns.
    pub fn as_char(self) -> char {
        match self {
            OsmType::Node => 'N',
            OsmType::Way => 'W',
            OsmType::Relation => 'R',
        }
    }
}

impl fmt::Display for OsmType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OsmType::Node => "node",
            OsmType::Way => "way",
            OsmType::Relation => "relation",
        };
        write!(f, "{s}")
    }
}

/// Relation member
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Member {
    /// node/way/relation id
    #[serde(rename = "ref")]
    pub ref_: Osmid,
    /// Role in relation
    pub role: String,
    /// Type: node/way/relation
    #[serde(rename = "type")]
    pub type_: OsmType,
}

/// Relation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relation {
    /// Relation id
    pub id: Osmid,
    /// List of ordered members
    pub members: Vec<Member>,
    /// Tags
    pub tags: Tags,
}

/// Action from a change file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Modify,
    Delete,
}

/// Bounding box in WGS84 degrees, used to filter nodes on import.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum BboxError {
    #[error("bounding box must be minLon,minLat,maxLon,maxLat: {0}")]
    Format(String),
    #[error("bounding box coordinate out of range: {0}")]
    Range(String),
    #[error("bounding box minimum not below maximum: {0}")]
    Empty(String),
}

impl FromStr for BoundingBox {
    type Err = BboxError;

    /// Parse a "minLon,minLat,maxLon,maxLat" string.
    fn from_str(s: &str) -> Result<BoundingBox, BboxError> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| BboxError::Format(s.to_string()))?;
        if parts.len() != 4 {
            return Err(BboxError::Format(s.to_string()));
        }
        let bbox = BoundingBox {
            min_lon: parts[0],
            min_lat: parts[1],
            max_lon: parts[2],
            max_lat: parts[3],
        };
        if bbox.min_lon < -180.0
            || bbox.max_lon > 180.0
            || bbox.min_lat < -90.0
            || bbox.max_lat > 90.0
        {
            return Err(BboxError::Range(s.to_string()));
        }
        if bbox.min_lon >= bbox.max_lon || bbox.min_lat >= bbox.max_lat {
            return Err(BboxError::Empty(s.to_string()));
        }
        Ok(bbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_last_wins() {
        let mut tags = Tags::new();
        tags.insert("highway", "primary");
        tags.insert("name", "Main Street");
        tags.insert("highway", "secondary");

        assert_eq!(2, tags.len());
        assert_eq!(Some("secondary"), tags.get("highway"));
        // first insert keeps its position
        assert_eq!("highway", tags.iter().next().unwrap().0);
    }

    #[test]
    fn node_coords() {
        let node = Node {
            id: 42,
            decimicro_lat: coord_to_decimicro(17.9031745),
            decimicro_lon: coord_to_decimicro(-62.8363074),
            tags: Tags::new(),
        };
        assert!((node.lat() - 17.9031745).abs() < 1e-9);
        assert!((node.lon() - -62.8363074).abs() < 1e-9);
        assert!(node.location_valid());

        let node = Node {
            decimicro_lat: coord_to_decimicro(91.0),
            ..Default::default()
        };
        assert!(!node.location_valid());
    }

    #[test]
    fn way_closed() {
        let mut way = Way {
            id: 1,
            nodes: vec![1, 2, 3, 1],
            tags: Tags::new(),
        };
        assert!(way.is_closed());
        way.nodes = vec![1, 2, 3];
        assert!(!way.is_closed());
        way.nodes = vec![1, 1];
        assert!(!way.is_closed());
    }

    #[test]
    fn bbox_parse() {
        let bbox: BoundingBox = "-5.5,41.2,9.8,51.3".parse().unwrap();
        assert_eq!(
            BoundingBox {
                min_lon: -5.5,
                min_lat: 41.2,
                max_lon: 9.8,
                max_lat: 51.3
            },
            bbox
        );
        assert!(bbox.contains(2.35, 48.85));
        assert!(!bbox.contains(-10.0, 48.85));

        assert!("1,2,3".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
        assert!("-200,0,0,50".parse::<BoundingBox>().is_err());
        assert!("5,10,5,20".parse::<BoundingBox>().is_err());
    }
}
