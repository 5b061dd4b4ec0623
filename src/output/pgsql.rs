//! Point/line/polygon table output
//!
//! The classic three-table layout: tagged nodes become rows of the point
//! table, ways become lines or polygons, multipolygon and boundary
//! relations become polygons and route relations become lines, both
//! under the negated relation id. Rows carry the object's tags as JSON
//! and the geometry in the configured target SRID.

use log::debug;
use postgres::{Client, NoTls, SimpleQueryMessage};
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::sync::Arc;

use crate::copy::{CopyMgr, CopyThread, MaintenanceTask, TableTarget};
use crate::ewkb;
use crate::expire::ExpireTiles;
use crate::geom::{build, ops, Geometry, PointList};
use crate::middle::MiddleRead;
use crate::options::Options;
use crate::osm::{Node, Osmid, OsmType, Relation, Tags, Way};
use crate::output::{Error, Output};
use crate::projection::Reprojection;

/// Configuration shared between an output and its worker clones.
struct Config {
    conninfo: String,
    projection: Reprojection,
    srid: i32,
    append: bool,
    extra_attributes: bool,
    tablespace_data: String,
    tablespace_index: String,
    expire_zoom: Option<u32>,
    point: Arc<TableTarget>,
    line: Arc<TableTarget>,
    polygon: Arc<TableTarget>,
}

impl Config {
    fn tablespace_data_clause(&self) -> String {
        if self.tablespace_data.is_empty() {
            String::new()
        } else {
            format!(" TABLESPACE \"{}\"", self.tablespace_data)
        }
    }

    fn tablespace_index_clause(&self) -> String {
        if self.tablespace_index.is_empty() {
            String::new()
        } else {
            format!(" TABLESPACE \"{}\"", self.tablespace_index)
        }
    }

    fn new_expire(&self) -> Option<ExpireTiles> {
        self.expire_zoom
            .map(|zoom| ExpireTiles::new(zoom, self.projection))
    }
}

pub struct PgsqlOutput {
    config: Arc<Config>,
    copy: CopyMgr,
    client: RefCell<Client>,
    expire: Option<ExpireTiles>,
    marked_ways: FxHashSet<Osmid>,
}

/// Serialise tags as a JSON object, in tag order.
fn tags_json(tags: &Tags) -> String {
    let mut out = String::from("{");
    for (i, (k, v)) in tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(k).unwrap());
        out.push(':');
        out.push_str(&serde_json::to_string(v).unwrap());
    }
    out.push('}');
    out
}

impl PgsqlOutput {
    pub fn new(opts: &Options, copy_thread: &Arc<CopyThread>) -> Result<PgsqlOutput, Error> {
        let table = |suffix: &str| {
            Arc::new(TableTarget {
                schema: String::new(),
                name: format!("{}_{suffix}", opts.prefix),
                columns: String::new(),
                id_column: String::from("osm_id"),
            })
        };

        let config = Arc::new(Config {
            conninfo: opts.conninfo.clone(),
            projection: opts.projection(),
            srid: opts.srid,
            append: opts.append,
            extra_attributes: opts.extra_attributes,
            tablespace_data: opts.tablespace_data.clone(),
            tablespace_index: opts.tablespace_index.clone(),
            expire_zoom: opts.expire_tiles_zoom,
            point: table("point"),
            line: table("line"),
            polygon: table("polygon"),
        });

        Self::with_config(config, copy_thread)
    }

    fn with_config(
        config: Arc<Config>,
        copy_thread: &Arc<CopyThread>,
    ) -> Result<PgsqlOutput, Error> {
        let mut client = Client::connect(&config.conninfo, NoTls)?;
        client.batch_execute("SET synchronous_commit = off")?;

        Ok(PgsqlOutput {
            expire: config.new_expire(),
            copy: CopyMgr::new(copy_thread.clone()),
            client: RefCell::new(client),
            marked_ways: FxHashSet::default(),
            config,
        })
    }

    /// Project a freshly built WGS84 geometry into the target system.
    fn to_target(&self, geom: &Geometry) -> Geometry {
        ops::transform(geom, &self.config.projection)
    }

    fn want_tags(&self, tags: &Tags) -> bool {
        self.config.extra_attributes || !tags.is_empty()
    }

    fn write_row(
        &mut self,
        target: &Arc<TableTarget>,
        id: Osmid,
        tags: &Tags,
        geom: &Geometry,
        area: Option<f64>,
    ) {
        if geom.is_null() {
            return;
        }
        let wkb = ewkb::encode(geom, false);
        let row = self.copy.new_row(target);
        row.add_int(id);
        row.add_str(&tags_json(tags));
        if let Some(area) = area {
            row.add_double(area);
        }
        row.add_hex_geom(&wkb);
        self.copy.end_row();

        if let Some(expire) = &mut self.expire {
            expire.expire_geometry(geom, id);
        }
    }

    /// Expire the tiles of rows about to be deleted, by reading their
    /// geometry back from the table. Only needed in append mode; during
    /// a bulk load there is nothing in the table yet.
    fn expire_existing(&mut self, target: &Arc<TableTarget>, id: Osmid) -> Result<(), Error> {
        if self.expire.is_none() || !self.config.append {
            return Ok(());
        }
        let rows = self.client.borrow_mut().simple_query(&format!(
            "SELECT way FROM {} WHERE osm_id = {id}",
            target.qualified_name()
        ))?;
        for message in rows {
            if let SimpleQueryMessage::Row(row) = message {
                if let Some(hex) = row.get(0) {
                    if let Ok(wkb) = ewkb::decode_hex(hex) {
                        if let Some(expire) = &mut self.expire {
                            expire.expire_from_ewkb(&wkb, id);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn delete_from(&mut self, target: &Arc<TableTarget>, id: Osmid) -> Result<(), Error> {
        self.expire_existing(target, id)?;
        self.copy.delete_id(target, id);
        Ok(())
    }

    /// Resolve the node lists of a relation's member ways.
    fn member_way_points(&self, rel: &Relation, mid: &dyn MiddleRead) -> Vec<PointList> {
        rel.members
            .iter()
            .filter(|m| m.type_ == OsmType::Way)
            .filter_map(|m| mid.way(m.ref_))
            .map(|way| mid.node_list(&way.nodes))
            .collect()
    }

    fn add_way(&mut self, way: &Way, mid: &dyn MiddleRead) -> Result<(), Error> {
        if !self.want_tags(&way.tags) {
            return Ok(());
        }
        let points = mid.node_list(&way.nodes);

        if way.is_closed() && way.tags.get("area") != Some("no") {
            let geom = self.to_target(&build::create_polygon(&points));
            let area = ops::area(&geom);
            self.write_row(
                &self.config.polygon.clone(),
                way.id,
                &way.tags,
                &geom,
                Some(area),
            );
        } else {
            let geom = self.to_target(&build::create_linestring(&points));
            self.write_row(&self.config.line.clone(), way.id, &way.tags, &geom, None);
        }
        Ok(())
    }

    fn add_relation(
        &mut self,
        rel: &Relation,
        mid: &dyn MiddleRead,
        mark_members: bool,
    ) -> Result<(), Error> {
        let Some(type_tag) = rel.tags.get("type") else {
            return Ok(());
        };

        match type_tag {
            "multipolygon" | "boundary" => {
                let ways = self.member_way_points(rel, mid);
                let geom = build::create_multipolygon(&ways);
                if geom.is_null() {
                    return Ok(());
                }
                let geom = self.to_target(&geom);
                let area = ops::area(&geom);
                self.write_row(
                    &self.config.polygon.clone(),
                    -rel.id,
                    &rel.tags,
                    &geom,
                    Some(area),
                );

                if mark_members {
                    // member ways get reprocessed in stage 2
                    for member in &rel.members {
                        if member.type_ == OsmType::Way {
                            self.marked_ways.insert(member.ref_);
                        }
                    }
                }
            }
            "route" => {
                let ways = self.member_way_points(rel, mid);
                let geom = self.to_target(&build::create_multilinestring(&ways, true));
                self.write_row(&self.config.line.clone(), -rel.id, &rel.tags, &geom, None);
            }
            _ => (),
        }
        Ok(())
    }
}

impl Output for PgsqlOutput {
    fn start(&mut self) -> Result<(), Error> {
        let tablespace = self.config.tablespace_data_clause();
        let mut client = self.client.borrow_mut();

        for (target, extra) in [
            (&self.config.point, ""),
            (&self.config.line, ""),
            (&self.config.polygon, "way_area real, "),
        ] {
            let table = target.qualified_name();
            if self.config.append {
                client
                    .batch_execute(&format!("SELECT 1 FROM {table} LIMIT 1"))
                    .map_err(|_| {
                        Error::Middle(crate::middle::Error::Corrupt(format!(
                            "append mode needs output table {table} from a previous import"
                        )))
                    })?;
                continue;
            }
            client.batch_execute(&format!("DROP TABLE IF EXISTS {table}"))?;
            client.batch_execute(&format!("DROP TABLE IF EXISTS \"{}_tmp\"", target.name))?;
            client.batch_execute(&format!(
                "CREATE UNLOGGED TABLE {table} \
                 (osm_id int8, tags jsonb, {extra}way geometry(Geometry, {})) \
                 WITH (autovacuum_enabled = off){tablespace}",
                self.config.srid
            ))?;
            debug!("created output table {table}");
        }
        Ok(())
    }

    fn node_add(&mut self, node: &Node) -> Result<(), Error> {
        if !self.want_tags(&node.tags) {
            return Ok(());
        }
        let geom = self.to_target(&build::create_point(node));
        self.write_row(&self.config.point.clone(), node.id, &node.tags, &geom, None);
        Ok(())
    }

    fn node_modify(&mut self, node: &Node) -> Result<(), Error> {
        self.node_delete(node.id)?;
        self.node_add(node)
    }

    fn node_delete(&mut self, id: Osmid) -> Result<(), Error> {
        self.delete_from(&self.config.point.clone(), id)
    }

    fn way_add(&mut self, way: &Way, mid: &dyn MiddleRead) -> Result<(), Error> {
        self.add_way(way, mid)
    }

    fn way_modify(&mut self, way: &Way, mid: &dyn MiddleRead) -> Result<(), Error> {
        self.way_delete(way.id)?;
        self.add_way(way, mid)
    }

    fn way_delete(&mut self, id: Osmid) -> Result<(), Error> {
        self.delete_from(&self.config.line.clone(), id)?;
        self.delete_from(&self.config.polygon.clone(), id)
    }

    fn relation_add(&mut self, rel: &Relation, mid: &dyn MiddleRead) -> Result<(), Error> {
        self.add_relation(rel, mid, true)
    }

    fn relation_modify(&mut self, rel: &Relation, mid: &dyn MiddleRead) -> Result<(), Error> {
        self.relation_delete(rel.id)?;
        self.add_relation(rel, mid, true)
    }

    fn relation_delete(&mut self, id: Osmid) -> Result<(), Error> {
        self.delete_from(&self.config.line.clone(), -id)?;
        self.delete_from(&self.config.polygon.clone(), -id)
    }

    fn pending_way(&mut self, id: Osmid, mid: &dyn MiddleRead) -> Result<(), Error> {
        self.way_delete(id)?;
        if let Some(entry) = mid.way(id) {
            let way = Way {
                id,
                nodes: entry.nodes,
                tags: entry.tags,
            };
            self.add_way(&way, mid)?;
        }
        Ok(())
    }

    fn pending_relation(&mut self, id: Osmid, mid: &dyn MiddleRead) -> Result<(), Error> {
        self.relation_delete(id)?;
        if let Some(entry) = mid.relation(id) {
            let rel = Relation {
                id,
                members: entry.members,
                tags: entry.tags,
            };
            self.add_relation(&rel, mid, true)?;
        }
        Ok(())
    }

    fn pending_relation_stage1c(&mut self, id: Osmid, mid: &dyn MiddleRead) -> Result<(), Error> {
        self.relation_delete(id)?;
        if let Some(entry) = mid.relation(id) {
            let rel = Relation {
                id,
                members: entry.members,
                tags: entry.tags,
            };
            self.add_relation(&rel, mid, false)?;
        }
        Ok(())
    }

    fn take_marked_way_ids(&mut self) -> Vec<Osmid> {
        let mut ids: Vec<Osmid> = self.marked_ways.drain().collect();
        ids.sort_unstable();
        ids
    }

    fn reprocess_marked(&mut self, mid: &dyn MiddleRead) -> Result<(), Error> {
        for id in self.take_marked_way_ids() {
            self.pending_way(id, mid)?;
        }
        Ok(())
    }

    fn sync(&mut self) {
        self.copy.sync();
    }

    fn stop(&mut self) -> Result<Vec<MaintenanceTask>, Error> {
        self.copy.sync();

        let mut tasks = Vec::new();
        for target in [
            &self.config.point,
            &self.config.line,
            &self.config.polygon,
        ] {
            let table = target.qualified_name();
            let name = &target.name;
            let tmp = format!("\"{name}_tmp\"");
            let sql = if self.config.append {
                format!("ANALYZE {table}")
            } else {
                // rewrite the table sorted by geometry, then index it
                format!(
                    "CREATE TABLE {tmp}{} AS SELECT * FROM {table} ORDER BY way; \
                     DROP TABLE {table}; \
                     ALTER TABLE {tmp} RENAME TO \"{name}\"; \
                     CREATE INDEX \"{name}_way_idx\" ON {table} USING GIST (way){}; \
                     CREATE INDEX \"{name}_osm_id_idx\" ON {table} (osm_id){}; \
                     ANALYZE {table}",
                    self.config.tablespace_data_clause(),
                    self.config.tablespace_index_clause(),
                    self.config.tablespace_index_clause(),
                )
            };
            tasks.push(MaintenanceTask {
                conninfo: self.config.conninfo.clone(),
                sql,
            });
        }
        Ok(tasks)
    }

    fn clone_for_worker(&self, copy: &Arc<CopyThread>) -> Result<Box<dyn Output>, Error> {
        Ok(Box::new(PgsqlOutput::with_config(
            self.config.clone(),
            copy,
        )?))
    }

    fn take_expire_tree(&mut self) -> Option<ExpireTiles> {
        let tree = self.expire.take();
        self.expire = self.config.new_expire();
        tree
    }

    fn merge_expire_tree(&mut self, tree: ExpireTiles) {
        match &mut self.expire {
            Some(mine) => mine.merge(tree),
            None => self.expire = Some(tree),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_as_json() {
        let mut tags = Tags::new();
        tags.insert("name", "Main \"Street\"");
        tags.insert("oneway", "yes");
        assert_eq!(
            "{\"name\":\"Main \\\"Street\\\"\",\"oneway\":\"yes\"}",
            tags_json(&tags)
        );
        assert_eq!("{}", tags_json(&Tags::new()));
    }
}
