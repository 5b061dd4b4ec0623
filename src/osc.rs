//! OsmChange (.osc / .osc.gz) reader
//!
//! Streaming XML parse of change files. The `<create>`, `<modify>` and
//! `<delete>` sections set the action applied to the objects inside
//! them; objects and their `<tag>`/`<nd>`/`<member>` children are
//! collected and handed to the input handler one at a time.

use flate2::bufread::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::input::{InputHandler, OsmObject};
use crate::osm::{self, Action, Member, Node, OsmType, Relation, Way};

enum CurObj {
    Empty,
    Node(Node),
    Way(Way),
    Relation(Relation),
}

fn xml_reader(filename: &Path) -> Result<Reader<Box<dyn BufRead>>, Box<dyn Error>> {
    let file = File::open(filename)?;
    let reader: Box<dyn BufRead> = if filename.extension().is_some_and(|e| e == "gz") {
        let gz = GzDecoder::new(BufReader::new(file));
        Box::new(BufReader::new(gz))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(Reader::from_reader(reader))
}

fn attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>, Box<dyn Error>> {
    for a in e.attributes() {
        let a = a?;
        if a.key.as_ref() == name {
            return Ok(Some(a.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn required(e: &BytesStart, name: &[u8]) -> Result<String, Box<dyn Error>> {
    attr(e, name)?.ok_or_else(|| {
        format!(
            "missing attribute {} on <{}>",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(e.name().as_ref())
        )
        .into()
    })
}

/// Read an OsmChange file into the handler.
pub fn read_osc(filename: &Path, handler: &mut InputHandler) -> Result<(), Box<dyn Error>> {
    let mut reader = xml_reader(filename)?;
    let mut buf = Vec::new();

    let mut action = Action::Create;
    let mut curobj = CurObj::Empty;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,

            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                match e.name().as_ref() {
                    b"create" => action = Action::Create,
                    b"modify" => action = Action::Modify,
                    b"delete" => action = Action::Delete,
                    b"node" => {
                        let node = Node {
                            id: required(e, b"id")?.parse()?,
                            decimicro_lat: osm::coord_to_decimicro(
                                attr(e, b"lat")?.map_or(Ok(0.0), |v| v.parse())?,
                            ),
                            decimicro_lon: osm::coord_to_decimicro(
                                attr(e, b"lon")?.map_or(Ok(0.0), |v| v.parse())?,
                            ),
                            ..Default::default()
                        };
                        if empty {
                            handler.object(OsmObject::Node(node), action)?;
                        } else {
                            curobj = CurObj::Node(node);
                        }
                    }
                    b"way" => {
                        let way = Way {
                            id: required(e, b"id")?.parse()?,
                            ..Default::default()
                        };
                        if empty {
                            handler.object(OsmObject::Way(way), action)?;
                        } else {
                            curobj = CurObj::Way(way);
                        }
                    }
                    b"relation" => {
                        let rel = Relation {
                            id: required(e, b"id")?.parse()?,
                            ..Default::default()
                        };
                        if empty {
                            handler.object(OsmObject::Relation(rel), action)?;
                        } else {
                            curobj = CurObj::Relation(rel);
                        }
                    }
                    b"tag" => {
                        let k = required(e, b"k")?;
                        let v = required(e, b"v")?;
                        match &mut curobj {
                            CurObj::Node(n) => n.tags.insert(&k, &v),
                            CurObj::Way(w) => w.tags.insert(&k, &v),
                            CurObj::Relation(r) => r.tags.insert(&k, &v),
                            CurObj::Empty => (),
                        }
                    }
                    b"nd" => {
                        if let CurObj::Way(w) = &mut curobj {
                            w.nodes.push(required(e, b"ref")?.parse()?);
                        }
                    }
                    b"member" => {
                        if let CurObj::Relation(r) = &mut curobj {
                            let type_ = match required(e, b"type")?.as_str() {
                                "node" => OsmType::Node,
                                "way" => OsmType::Way,
                                "relation" => OsmType::Relation,
                                other => {
                                    return Err(
                                        format!("unknown member type \"{other}\"").into()
                                    )
                                }
                            };
                            r.members.push(Member {
                                ref_: required(e, b"ref")?.parse()?,
                                role: attr(e, b"role")?.unwrap_or_default(),
                                type_,
                            });
                        }
                    }
                    _ => (),
                }
            }

            Event::End(ref e) => match e.name().as_ref() {
                b"node" | b"way" | b"relation" => {
                    match std::mem::replace(&mut curobj, CurObj::Empty) {
                        CurObj::Node(n) => handler.object(OsmObject::Node(n), action)?,
                        CurObj::Way(w) => handler.object(OsmObject::Way(w), action)?,
                        CurObj::Relation(r) => handler.object(OsmObject::Relation(r), action)?,
                        CurObj::Empty => (),
                    }
                }
                _ => (),
            },

            _ => (),
        }
        buf.clear();
    }

    handler.eof()?;
    Ok(())
}
