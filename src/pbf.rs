//! PBF file reader
//!
//! Thin mapping from osmpbfreader's object model onto ours; all the
//! real processing happens behind the [`InputHandler`].

use osmpbfreader;
use std::error::Error;
use std::fs::File;
use std::path::Path;

use crate::input::{InputHandler, OsmObject};
use crate::osm::{Action, Member, Node, OsmType, Relation, Tags, Way};

fn convert_tags(tags: &osmpbfreader::Tags) -> Tags {
    tags.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Read a .osm.pbf file into the handler. PBF carries no actions, every
/// object is a create.
pub fn read_pbf(filename: &Path, handler: &mut InputHandler) -> Result<(), Box<dyn Error>> {
    let file = File::open(filename)?;
    let mut pbf = osmpbfreader::OsmPbfReader::new(file);

    for obj in pbf.iter() {
        let obj = obj?;
        let object = match obj {
            osmpbfreader::OsmObj::Node(node) => OsmObject::Node(Node {
                id: node.id.0,
                decimicro_lat: node.decimicro_lat,
                decimicro_lon: node.decimicro_lon,
                tags: convert_tags(&node.tags),
            }),
            osmpbfreader::OsmObj::Way(way) => OsmObject::Way(Way {
                id: way.id.0,
                nodes: way.nodes.iter().map(|n| n.0).collect(),
                tags: convert_tags(&way.tags),
            }),
            osmpbfreader::OsmObj::Relation(relation) => {
                let members = relation
                    .refs
                    .iter()
                    .map(|r| {
                        let (ref_, type_) = match r.member {
                            osmpbfreader::OsmId::Node(id) => (id.0, OsmType::Node),
                            osmpbfreader::OsmId::Way(id) => (id.0, OsmType::Way),
                            osmpbfreader::OsmId::Relation(id) => (id.0, OsmType::Relation),
                        };
                        Member {
                            ref_,
                            role: r.role.to_string(),
                            type_,
                        }
                    })
                    .collect();
                OsmObject::Relation(Relation {
                    id: relation.id.0,
                    members,
                    tags: convert_tags(&relation.tags),
                })
            }
        };
        handler.object(object, Action::Create)?;
    }
    handler.eof()?;

    Ok(())
}
