//! Database-persisted ("slim") middle
//!
//! Ways and relations live in database tables keyed by id, so a later
//! run can apply a change file against them. Node locations are served
//! from RAM, from a flat node file, or from a nodes table when neither
//! is available across runs. Reverse-reference queries for the
//! dependency manager run against GIN-indexed array columns.
//!
//! Bulk imports stream the tables through the COPY pipeline; append mode
//! upserts through prepared statements.

use log::debug;
use postgres::{Client, NoTls};
use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;

use crate::copy::{CopyMgr, CopyThread, MaintenanceTask, TableTarget};
use crate::geom::Point;
use crate::middle::flatnodes::FlatNodeStore;
use crate::middle::ram::NodeStore;
use crate::middle::{BackRefs, Error, Middle, MiddleRead, RelEntry, WayEntry};
use crate::options::Options;
use crate::osm::{Member, Osmid, OsmType, Tags};

/// Where node locations live.
enum NodeBackend {
    Ram(NodeStore),
    Flat(FlatNodeStore),
    /// `<prefix>_nodes` table; required for append mode when no flat
    /// node file is configured.
    Db,
}

pub struct PgMiddle {
    client: RefCell<Client>,
    conninfo: String,
    schema: String,
    prefix: String,
    append: bool,
    scale: i32,
    tablespace_data: String,
    tablespace_index: String,
    nodes: NodeBackend,
    /// COPY pipeline for the bulk load; None in append mode.
    copy: Option<CopyMgr>,
    copy_thread: Option<Arc<CopyThread>>,
    nodes_target: Arc<TableTarget>,
    ways_target: Arc<TableTarget>,
    rels_target: Arc<TableTarget>,
}

fn table_name(schema: &str, prefix: &str, suffix: &str) -> String {
    if schema.is_empty() {
        format!("\"{prefix}_{suffix}\"")
    } else {
        format!("\"{schema}\".\"{prefix}_{suffix}\"")
    }
}

fn tags_to_array(tags: &Tags) -> Vec<String> {
    let mut flat = Vec::with_capacity(tags.len() * 2);
    for (k, v) in tags {
        flat.push(k.clone());
        flat.push(v.clone());
    }
    flat
}

fn tags_from_array(flat: Option<Vec<String>>) -> Tags {
    let mut tags = Tags::new();
    if let Some(flat) = flat {
        for kv in flat.chunks_exact(2) {
            tags.insert(&kv[0], &kv[1]);
        }
    }
    tags
}

fn member_way_refs(members: &[Member]) -> Vec<Osmid> {
    let mut refs: Vec<Osmid> = members
        .iter()
        .filter(|m| m.type_ == OsmType::Way)
        .map(|m| m.ref_)
        .collect();
    refs.sort_unstable();
    refs.dedup();
    refs
}

impl PgMiddle {
    /// Connect and prepare the middle tables.
    ///
    /// In bulk mode existing tables are replaced by fresh UNLOGGED ones.
    /// In append mode the tables from the previous run must exist; a
    /// missing nodes table without a flat node file is a configuration
    /// error surfaced by [`Options::validate`](crate::options::Options).
    pub fn new(opts: &Options) -> Result<PgMiddle, Error> {
        let mut client = Client::connect(&opts.conninfo, NoTls)?;
        client.batch_execute("SET synchronous_commit = off")?;

        let nodes = match &opts.flat_node_file {
            Some(path) => NodeBackend::Flat(FlatNodeStore::open(Path::new(path), opts.scale)?),
            None if opts.cache_size_mb > 0 && !opts.append => {
                NodeBackend::Ram(NodeStore::new(opts.scale))
            }
            None => NodeBackend::Db,
        };

        let schema = opts.middle_schema.clone();
        let prefix = opts.prefix.clone();
        let nodes_target = Arc::new(TableTarget {
            schema: schema.clone(),
            name: format!("{prefix}_nodes"),
            columns: String::from("id,lon,lat"),
            id_column: String::from("id"),
        });
        let ways_target = Arc::new(TableTarget {
            schema: schema.clone(),
            name: format!("{prefix}_ways"),
            columns: String::from("id,nodes,tags"),
            id_column: String::from("id"),
        });
        let rels_target = Arc::new(TableTarget {
            schema: schema.clone(),
            name: format!("{prefix}_rels"),
            columns: String::from("id,way_refs,members,tags"),
            id_column: String::from("id"),
        });

        let mut middle = PgMiddle {
            client: RefCell::new(client),
            conninfo: opts.conninfo.clone(),
            schema,
            prefix,
            append: opts.append,
            scale: opts.scale,
            tablespace_data: opts.tablespace_data.clone(),
            tablespace_index: opts.tablespace_index.clone(),
            nodes,
            copy: None,
            copy_thread: None,
            nodes_target,
            ways_target,
            rels_target,
        };

        if opts.append {
            middle.check_tables()?;
        } else {
            middle.create_tables()?;
            let thread = Arc::new(CopyThread::new(&opts.conninfo));
            middle.copy = Some(CopyMgr::new(thread.clone()));
            middle.copy_thread = Some(thread);
        }

        Ok(middle)
    }

    fn table(&self, suffix: &str) -> String {
        table_name(&self.schema, &self.prefix, suffix)
    }

    fn create_tables(&mut self) -> Result<(), Error> {
        let tablespace = if self.tablespace_data.is_empty() {
            String::new()
        } else {
            format!(" TABLESPACE \"{}\"", self.tablespace_data)
        };
        let mut client = self.client.borrow_mut();
        for (suffix, columns) in [
            ("nodes", "id int8 PRIMARY KEY, lon int4 NOT NULL, lat int4 NOT NULL"),
            ("ways", "id int8 PRIMARY KEY, nodes int8[] NOT NULL, tags text[]"),
            (
                "rels",
                "id int8 PRIMARY KEY, way_refs int8[] NOT NULL, members text NOT NULL, tags text[]",
            ),
        ] {
            if suffix == "nodes" && !matches!(self.nodes, NodeBackend::Db) {
                continue;
            }
            let table = table_name(&self.schema, &self.prefix, suffix);
            client.batch_execute(&format!("DROP TABLE IF EXISTS {table}"))?;
            client.batch_execute(&format!(
                "CREATE UNLOGGED TABLE {table} ({columns}) \
                 WITH (autovacuum_enabled = off){tablespace}"
            ))?;
            debug!("created middle table {table}");
        }
        Ok(())
    }

    fn check_tables(&mut self) -> Result<(), Error> {
        let mut client = self.client.borrow_mut();
        for suffix in ["nodes", "ways", "rels"] {
            if suffix == "nodes" && !matches!(self.nodes, NodeBackend::Db) {
                continue;
            }
            let table = table_name(&self.schema, &self.prefix, suffix);
            client
                .batch_execute(&format!("SELECT 1 FROM {table} LIMIT 1"))
                .map_err(|_| {
                    Error::Corrupt(format!(
                        "append mode needs middle table {table} from a previous import"
                    ))
                })?;
        }
        Ok(())
    }
}

impl MiddleRead for PgMiddle {
    fn node(&self, id: Osmid) -> Option<Point> {
        match &self.nodes {
            NodeBackend::Ram(store) => store.get(id),
            NodeBackend::Flat(store) => store.get(id),
            NodeBackend::Db => db_node(
                &mut self.client.borrow_mut(),
                &self.table("nodes"),
                id,
                self.scale,
            ),
        }
    }

    fn way(&self, id: Osmid) -> Option<WayEntry> {
        db_way(&mut self.client.borrow_mut(), &self.table("ways"), id)
    }

    fn relation(&self, id: Osmid) -> Option<RelEntry> {
        db_relation(&mut self.client.borrow_mut(), &self.table("rels"), id)
    }
}

fn db_node(client: &mut Client, table: &str, id: Osmid, scale: i32) -> Option<Point> {
    let row = client
        .query_opt(format!("SELECT lon, lat FROM {table} WHERE id = $1").as_str(), &[&id])
        .ok()??;
    let lon: i32 = row.get(0);
    let lat: i32 = row.get(1);
    Some(Point::new(
        f64::from(lon) / f64::from(scale),
        f64::from(lat) / f64::from(scale),
    ))
}

fn db_way(client: &mut Client, table: &str, id: Osmid) -> Option<WayEntry> {
    let row = client
        .query_opt(
            format!("SELECT nodes, tags FROM {table} WHERE id = $1").as_str(),
            &[&id],
        )
        .ok()??;
    let nodes: Vec<i64> = row.get(0);
    let tags: Option<Vec<String>> = row.get(1);
    Some(WayEntry {
        tags: tags_from_array(tags),
        nodes,
    })
}

fn db_relation(client: &mut Client, table: &str, id: Osmid) -> Option<RelEntry> {
    let row = client
        .query_opt(
            format!("SELECT members, tags FROM {table} WHERE id = $1").as_str(),
            &[&id],
        )
        .ok()??;
    let members: String = row.get(0);
    let tags: Option<Vec<String>> = row.get(1);
    let members: Vec<Member> = serde_json::from_str(&members).ok()?;
    Some(RelEntry {
        tags: tags_from_array(tags),
        members,
    })
}

impl Middle for PgMiddle {
    fn put_node(&mut self, id: Osmid, lon: f64, lat: f64) -> Result<(), Error> {
        match &mut self.nodes {
            NodeBackend::Ram(store) => {
                store.set(id, lon, lat);
            }
            NodeBackend::Flat(store) => store.set(id, lon, lat)?,
            NodeBackend::Db => {
                let dlon = (lon * f64::from(self.scale)).round() as i32;
                let dlat = (lat * f64::from(self.scale)).round() as i32;
                if let Some(copy) = &mut self.copy {
                    let row = copy.new_row(&self.nodes_target);
                    row.add_int(id);
                    row.add_int(i64::from(dlon));
                    row.add_int(i64::from(dlat));
                    copy.end_row();
                } else {
                    let table = self.table("nodes");
                    self.client.borrow_mut().execute(
                        format!(
                            "INSERT INTO {table} (id, lon, lat) VALUES ($1, $2, $3) \
                             ON CONFLICT (id) DO UPDATE SET lon = excluded.lon, \
                             lat = excluded.lat"
                        )
                        .as_str(),
                        &[&id, &dlon, &dlat],
                    )?;
                }
            }
        }
        Ok(())
    }

    fn put_way(&mut self, id: Osmid, tags: Tags, nodes: Vec<Osmid>) -> Result<(), Error> {
        if let Some(copy) = &mut self.copy {
            let row = copy.new_row(&self.ways_target);
            row.add_int(id);
            row.new_array();
            for node in &nodes {
                row.add_array_int(*node);
            }
            row.finish_array();
            row.new_array();
            for (k, v) in &tags {
                row.add_array_str(k);
                row.add_array_str(v);
            }
            row.finish_array();
            copy.end_row();
        } else {
            let table = self.table("ways");
            self.client.borrow_mut().execute(
                format!(
                    "INSERT INTO {table} (id, nodes, tags) VALUES ($1, $2, $3) \
                     ON CONFLICT (id) DO UPDATE SET nodes = excluded.nodes, \
                     tags = excluded.tags"
                )
                .as_str(),
                &[&id, &nodes, &tags_to_array(&tags)],
            )?;
        }
        Ok(())
    }

    fn put_relation(&mut self, id: Osmid, tags: Tags, members: Vec<Member>) -> Result<(), Error> {
        let members_json = serde_json::to_string(&members)
            .map_err(|e| Error::Corrupt(format!("relation {id}: {e}")))?;
        let way_refs = member_way_refs(&members);
        if let Some(copy) = &mut self.copy {
            let row = copy.new_row(&self.rels_target);
            row.add_int(id);
            row.new_array();
            for way in &way_refs {
                row.add_array_int(*way);
            }
            row.finish_array();
            row.add_str(&members_json);
            row.new_array();
            for (k, v) in &tags {
                row.add_array_str(k);
                row.add_array_str(v);
            }
            row.finish_array();
            copy.end_row();
        } else {
            let table = self.table("rels");
            self.client.borrow_mut().execute(
                format!(
                    "INSERT INTO {table} (id, way_refs, members, tags) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (id) DO UPDATE SET way_refs = excluded.way_refs, \
                     members = excluded.members, tags = excluded.tags"
                )
                .as_str(),
                &[&id, &way_refs, &members_json, &tags_to_array(&tags)],
            )?;
        }
        Ok(())
    }

    fn delete_node(&mut self, id: Osmid) -> Result<(), Error> {
        match &mut self.nodes {
            NodeBackend::Ram(store) => store.remove(id),
            NodeBackend::Flat(store) => store.remove(id)?,
            NodeBackend::Db => {
                let table = self.table("nodes");
                self.client
                    .borrow_mut()
                    .execute(format!("DELETE FROM {table} WHERE id = $1").as_str(), &[&id])?;
            }
        }
        Ok(())
    }

    fn delete_way(&mut self, id: Osmid) -> Result<(), Error> {
        let table = self.table("ways");
        self.client
            .borrow_mut()
            .execute(format!("DELETE FROM {table} WHERE id = $1").as_str(), &[&id])?;
        Ok(())
    }

    fn delete_relation(&mut self, id: Osmid) -> Result<(), Error> {
        let table = self.table("rels");
        self.client
            .borrow_mut()
            .execute(format!("DELETE FROM {table} WHERE id = $1").as_str(), &[&id])?;
        Ok(())
    }

    fn after_nodes(&mut self) -> Result<(), Error> {
        if let NodeBackend::Flat(store) = &mut self.nodes {
            store.flush()?;
        }
        if let Some(copy) = &mut self.copy {
            // make bulk-loaded node rows visible to way processing
            copy.sync();
        }
        Ok(())
    }

    fn after_ways(&mut self) -> Result<(), Error> {
        if let Some(copy) = &mut self.copy {
            copy.sync();
        }
        Ok(())
    }

    fn after_relations(&mut self) -> Result<(), Error> {
        if let Some(mut copy) = self.copy.take() {
            copy.sync();
        }
        if let Some(thread) = self.copy_thread.take() {
            thread.finish();
        }
        Ok(())
    }

    fn as_read(&self) -> &dyn MiddleRead {
        self
    }

    fn backrefs(&self) -> Option<&dyn BackRefs> {
        Some(self)
    }

    fn query_handle(&self) -> Result<Box<dyn MiddleRead + Send + '_>, Error> {
        let mut client = Client::connect(&self.conninfo, NoTls)?;
        client.batch_execute("SET synchronous_commit = off")?;
        client.batch_execute("SET enable_seqscan = off")?;
        Ok(Box::new(PgQuery {
            client: RefCell::new(client),
            nodes: &self.nodes,
            scale: self.scale,
            nodes_table: self.table("nodes"),
            ways_table: self.table("ways"),
            rels_table: self.table("rels"),
        }))
    }

    fn stop(&mut self, droptemp: bool) -> Result<Vec<MaintenanceTask>, Error> {
        let mut tasks = Vec::new();
        let task = |sql: String| MaintenanceTask {
            conninfo: self.conninfo.clone(),
            sql,
        };

        if droptemp {
            for suffix in ["nodes", "ways", "rels"] {
                tasks.push(task(format!("DROP TABLE IF EXISTS {}", self.table(suffix))));
            }
            return Ok(tasks);
        }

        if self.append {
            // indexes already exist from the initial import
            return Ok(tasks);
        }

        let tablespace = if self.tablespace_index.is_empty() {
            String::new()
        } else {
            format!(" TABLESPACE \"{}\"", self.tablespace_index)
        };
        let nodes = self.table("nodes");
        let ways = self.table("ways");
        let rels = self.table("rels");
        if matches!(self.nodes, NodeBackend::Db) {
            tasks.push(task(format!("ANALYZE {nodes}")));
        }
        tasks.push(task(format!(
            "CREATE INDEX ON {ways} USING GIN (nodes) WITH (fastupdate = off){tablespace}; \
             ANALYZE {ways}"
        )));
        tasks.push(task(format!(
            "CREATE INDEX ON {rels} USING GIN (way_refs) WITH (fastupdate = off){tablespace}; \
             ANALYZE {rels}"
        )));
        Ok(tasks)
    }
}

impl BackRefs for PgMiddle {
    fn ways_using_node(&self, id: Osmid) -> Result<Vec<Osmid>, Error> {
        let table = self.table("ways");
        let rows = self.client.borrow_mut().query(
            format!("SELECT id FROM {table} WHERE nodes && ARRAY[$1::int8] ORDER BY id").as_str(),
            &[&id],
        )?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    fn relations_using_way(&self, id: Osmid) -> Result<Vec<Osmid>, Error> {
        let table = self.table("rels");
        let rows = self.client.borrow_mut().query(
            format!("SELECT id FROM {table} WHERE way_refs && ARRAY[$1::int8] ORDER BY id").as_str(),
            &[&id],
        )?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }
}

/// Per-worker read handle with its own database connection. Node reads
/// go to the shared in-process store when one exists.
struct PgQuery<'a> {
    client: RefCell<Client>,
    nodes: &'a NodeBackend,
    scale: i32,
    nodes_table: String,
    ways_table: String,
    rels_table: String,
}

impl MiddleRead for PgQuery<'_> {
    fn node(&self, id: Osmid) -> Option<Point> {
        match self.nodes {
            NodeBackend::Ram(store) => store.get(id),
            NodeBackend::Flat(store) => store.get(id),
            NodeBackend::Db => db_node(
                &mut self.client.borrow_mut(),
                &self.nodes_table,
                id,
                self.scale,
            ),
        }
    }

    fn way(&self, id: Osmid) -> Option<WayEntry> {
        db_way(&mut self.client.borrow_mut(), &self.ways_table, id)
    }

    fn relation(&self, id: Osmid) -> Option<RelEntry> {
        db_relation(&mut self.client.borrow_mut(), &self.rels_table, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::OsmType;

    #[test]
    fn table_names() {
        assert_eq!(
            "\"planet_osm_ways\"",
            table_name("", "planet_osm", "ways")
        );
        assert_eq!(
            "\"osm\".\"planet_osm_rels\"",
            table_name("osm", "planet_osm", "rels")
        );
    }

    #[test]
    fn tags_array_round_trip() {
        let mut tags = Tags::new();
        tags.insert("highway", "primary");
        tags.insert("name", "A1");

        let flat = tags_to_array(&tags);
        assert_eq!(vec!["highway", "primary", "name", "A1"], flat);
        assert_eq!(tags, tags_from_array(Some(flat)));
        assert_eq!(Tags::new(), tags_from_array(None));
    }

    #[test]
    fn member_json_round_trip() {
        let members = vec![
            Member {
                ref_: 10,
                role: String::from("outer"),
                type_: OsmType::Way,
            },
            Member {
                ref_: 11,
                role: String::new(),
                type_: OsmType::Node,
            },
        ];
        let json = serde_json::to_string(&members).unwrap();
        assert_eq!(members, serde_json::from_str::<Vec<Member>>(&json).unwrap());
    }

    #[test]
    fn way_refs_sorted_unique() {
        let members = vec![
            Member {
                ref_: 30,
                role: String::from("outer"),
                type_: OsmType::Way,
            },
            Member {
                ref_: 10,
                role: String::from("inner"),
                type_: OsmType::Way,
            },
            Member {
                ref_: 30,
                role: String::from("outer"),
                type_: OsmType::Way,
            },
            Member {
                ref_: 5,
                role: String::new(),
                type_: OsmType::Node,
            },
        ];
        assert_eq!(vec![10, 30], member_way_refs(&members));
    }
}
