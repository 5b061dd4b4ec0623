//! Input adapter
//!
//! Sits between a file reader and the driver: counts objects, prints
//! progress, enforces the node→way→relation input ordering and fires
//! the phase transitions the middle relies on.

use chrono::Local;
use std::time::Instant;
use thiserror::Error;

use crate::driver::{self, Osmdata};
use crate::osm::{Action, Node, Osmid, OsmType, Relation, Way};

macro_rules! printlnt {
    ($($arg:tt)*) => {
        println!("{} {}", Local::now().format("%Y-%m-%d %H:%M:%S"), format_args!($($arg)*));
    };
}

/// One parsed OSM object on its way into the driver.
#[derive(Debug)]
pub enum OsmObject {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl OsmObject {
    pub fn type_(&self) -> OsmType {
        match self {
            OsmObject::Node(_) => OsmType::Node,
            OsmObject::Way(_) => OsmType::Way,
            OsmObject::Relation(_) => OsmType::Relation,
        }
    }

    pub fn id(&self) -> Osmid {
        match self {
            OsmObject::Node(n) => n.id,
            OsmObject::Way(w) => w.id,
            OsmObject::Relation(r) => r.id,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("input data is not ordered: {curr} {curr_id} after {last} {last_id}")]
    Unordered {
        last: OsmType,
        last_id: Osmid,
        curr: OsmType,
        curr_id: Osmid,
    },
    #[error("input file contains deleted objects but you are not in append mode")]
    DeleteWithoutAppend,
    #[error(transparent)]
    Driver(#[from] driver::Error),
}

/// Print a counter line every so many objects: frequent enough to show
/// life, rare enough to not drown the log.
const NODE_REPORT_EVERY: u64 = 10_000;
const WAY_REPORT_EVERY: u64 = 1_000;
const REL_REPORT_EVERY: u64 = 10;

#[derive(Default)]
struct Counters {
    nodes: u64,
    ways: u64,
    relations: u64,
}

/// Feeds parsed objects into the driver.
pub struct InputHandler<'a> {
    driver: &'a mut Osmdata,
    append: bool,
    counters: Counters,
    started: Instant,
    last: Option<(OsmType, Osmid)>,
    current_type: OsmType,
}

impl<'a> InputHandler<'a> {
    pub fn new(driver: &'a mut Osmdata, append: bool) -> InputHandler<'a> {
        InputHandler {
            driver,
            append,
            counters: Counters::default(),
            started: Instant::now(),
            last: None,
            current_type: OsmType::Node,
        }
    }

    fn check_ordering(&mut self, type_: OsmType, id: Osmid) -> Result<(), Error> {
        // change files interleave object types across their
        // create/modify/delete sections, only bulk input is ordered
        if self.append {
            return Ok(());
        }
        if let Some((last_type, last_id)) = self.last {
            let ordered = match last_type.cmp(&type_) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => last_id < id,
                std::cmp::Ordering::Greater => false,
            };
            if !ordered {
                return Err(Error::Unordered {
                    last: last_type,
                    last_id,
                    curr: type_,
                    curr_id: id,
                });
            }
        }
        self.last = Some((type_, id));
        Ok(())
    }

    fn switch_type(&mut self, type_: OsmType) -> Result<(), Error> {
        if type_ == self.current_type || self.append {
            return Ok(());
        }
        if self.current_type == OsmType::Node {
            self.driver.after_nodes()?;
        }
        if type_ == OsmType::Relation && self.current_type != OsmType::Relation {
            self.driver.after_ways()?;
        }
        self.current_type = type_;
        Ok(())
    }

    pub fn object(&mut self, object: OsmObject, action: Action) -> Result<(), Error> {
        if action == Action::Delete && !self.append {
            return Err(Error::DeleteWithoutAppend);
        }
        self.check_ordering(object.type_(), object.id())?;
        self.switch_type(object.type_())?;

        match object {
            OsmObject::Node(node) => {
                self.driver.node(&node, action)?;
                self.counters.nodes += 1;
                if self.counters.nodes % NODE_REPORT_EVERY == 0 {
                    self.report();
                }
            }
            OsmObject::Way(way) => {
                self.driver.way(&way, action)?;
                self.counters.ways += 1;
                if self.counters.ways % WAY_REPORT_EVERY == 0 {
                    self.report();
                }
            }
            OsmObject::Relation(rel) => {
                self.driver.relation(&rel, action)?;
                self.counters.relations += 1;
                if self.counters.relations % REL_REPORT_EVERY == 0 {
                    self.report();
                }
            }
        }
        Ok(())
    }

    fn report(&self) {
        let elapsed = self.started.elapsed().as_secs().max(1);
        printlnt!(
            "processing: nodes({}k {}/s) ways({}k {}/s) relations({} {}/s)",
            self.counters.nodes / 1000,
            self.counters.nodes / elapsed,
            self.counters.ways / 1000,
            self.counters.ways / elapsed,
            self.counters.relations,
            self.counters.relations / elapsed,
        );
    }

    /// End of input: run the remaining phase transitions and print the
    /// summary.
    pub fn eof(&mut self) -> Result<(), Error> {
        if self.current_type == OsmType::Node {
            self.driver.after_nodes()?;
        }
        if self.current_type != OsmType::Relation {
            self.driver.after_ways()?;
        }
        self.driver.after_relations()?;

        printlnt!(
            "read {} nodes, {} ways, {} relations in {}s",
            self.counters.nodes,
            self.counters.ways,
            self.counters.relations,
            self.started.elapsed().as_secs(),
        );
        Ok(())
    }
}
