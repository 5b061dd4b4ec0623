//! COPY pipeline to the database
//!
//! Producers fill per-table byte buffers in the COPY text format and hand
//! them over a bounded queue to a writer thread that owns the database
//! connection. Buffers move across the thread boundary, they are never
//! shared. Deletes are interleaved with the buffers so that a row delete
//! always reaches the database before rows enqueued after it.

use log::error;
use postgres::{Client, NoTls};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::osm::{Osmid, OsmType};

/// Buffers above this size are handed to the writer thread.
pub const MAX_BUF_SIZE: usize = 10 * 1024 * 1024;

/// Maximum number of buffers waiting in a writer queue; producers block
/// when it is reached.
const MAX_BUFFERS: usize = 10;

/// Table information necessary for building the COPY and DELETE
/// statements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableTarget {
    /// Schema the table lives in; empty for the default search path.
    pub schema: String,
    /// Name of the target table.
    pub name: String,
    /// Comma-separated column list for the copy operation; empty copies
    /// all columns.
    pub columns: String,
    /// Name of the id column used when deleting objects. For tables keyed
    /// by type and id this is "type_column,id_column".
    pub id_column: String,
}

impl TableTarget {
    pub fn qualified_name(&self) -> String {
        if self.schema.is_empty() {
            format!("\"{}\"", self.name)
        } else {
            format!("\"{}\".\"{}\"", self.schema, self.name)
        }
    }

    fn copy_sql(&self) -> String {
        if self.columns.is_empty() {
            format!("COPY {} FROM STDIN", self.qualified_name())
        } else {
            format!("COPY {} ({}) FROM STDIN", self.qualified_name(), self.columns)
        }
    }

    /// Two buffers can share one COPY statement when this matches.
    pub fn same_copy_target(&self, other: &TableTarget) -> bool {
        self.name == other.name && self.schema == other.schema && self.columns == other.columns
    }
}

/// Rows to delete before a buffer is copied.
#[derive(Debug, Clone, PartialEq)]
pub enum Deletables {
    Ids(Vec<Osmid>),
    TypedIds(Vec<(OsmType, Osmid)>),
}

impl Deletables {
    pub fn is_empty(&self) -> bool {
        match self {
            Deletables::Ids(v) => v.is_empty(),
            Deletables::TypedIds(v) => v.is_empty(),
        }
    }

    /// DELETE statement for the collected ids, None when there is
    /// nothing to delete.
    fn delete_sql(&self, target: &TableTarget) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        match self {
            Deletables::Ids(ids) => {
                let list: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                Some(format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    target.qualified_name(),
                    target.id_column,
                    list.join(",")
                ))
            }
            Deletables::TypedIds(ids) => {
                let (type_column, id_column) = target
                    .id_column
                    .split_once(',')
                    .expect("two-column delete target needs \"type,id\" id_column");
                let values: Vec<String> = ids
                    .iter()
                    .map(|(t, id)| format!("('{}',{})", t.as_char(), id))
                    .collect();
                Some(format!(
                    "DELETE FROM {} p USING (VALUES {}) AS v(osm_type, osm_id) \
                     WHERE p.{} = v.osm_type::char(1) AND p.{} = v.osm_id",
                    target.qualified_name(),
                    values.join(","),
                    type_column,
                    id_column
                ))
            }
        }
    }
}

/// A buffer of COPY rows for one table, plus the rows to delete first.
pub struct CopyBuffer {
    target: Arc<TableTarget>,
    buffer: Vec<u8>,
    deletables: Deletables,
}

impl CopyBuffer {
    pub fn new(target: Arc<TableTarget>) -> CopyBuffer {
        CopyBuffer {
            target,
            buffer: Vec::with_capacity(MAX_BUF_SIZE / 8),
            deletables: Deletables::Ids(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.deletables.is_empty()
    }

    /// Finish a row with the row delimiter.
    pub fn end_row(&mut self) {
        // a trailing column delimiter is replaced, not kept
        if self.buffer.last() == Some(&b'\t') {
            self.buffer.pop();
        }
        self.buffer.push(b'\n');
    }

    fn escape_into(buffer: &mut Vec<u8>, value: &str) {
        for c in value.bytes() {
            match c {
                b'"' => buffer.extend_from_slice(b"\\\""),
                b'\\' => buffer.extend_from_slice(b"\\\\"),
                b'\n' => buffer.extend_from_slice(b"\\n"),
                b'\r' => buffer.extend_from_slice(b"\\r"),
                b'\t' => buffer.extend_from_slice(b"\\t"),
                _ => buffer.push(c),
            }
        }
    }

    /// Escaping for values inside array or hstore syntax, which passes
    /// through the COPY unescaping once more.
    fn escape_double_into(buffer: &mut Vec<u8>, value: &str) {
        for c in value.bytes() {
            match c {
                b'"' => buffer.extend_from_slice(b"\\\\\""),
                b'\\' => buffer.extend_from_slice(b"\\\\\\\\"),
                b'\n' => buffer.extend_from_slice(b"\\n"),
                b'\r' => buffer.extend_from_slice(b"\\r"),
                b'\t' => buffer.extend_from_slice(b"\\t"),
                _ => buffer.push(c),
            }
        }
    }

    pub fn add_str(&mut self, value: &str) {
        Self::escape_into(&mut self.buffer, value);
        self.buffer.push(b'\t');
    }

    pub fn add_int(&mut self, value: i64) {
        self.buffer.extend_from_slice(value.to_string().as_bytes());
        self.buffer.push(b'\t');
    }

    pub fn add_double(&mut self, value: f64) {
        self.buffer.extend_from_slice(value.to_string().as_bytes());
        self.buffer.push(b'\t');
    }

    pub fn add_bool(&mut self, value: bool) {
        self.buffer.push(if value { b't' } else { b'f' });
        self.buffer.push(b'\t');
    }

    /// NULL column.
    pub fn add_null(&mut self) {
        self.buffer.extend_from_slice(b"\\N\t");
    }

    /// Geometry column: hex-encoded EWKB. An empty (null geometry)
    /// encoding becomes a NULL column.
    pub fn add_hex_geom(&mut self, ewkb: &[u8]) {
        if ewkb.is_empty() {
            self.add_null();
            return;
        }
        self.buffer
            .extend_from_slice(crate::ewkb::encode_hex(ewkb).as_bytes());
        self.buffer.push(b'\t');
    }

    /// Start an array column; elements follow, then `finish_array`.
    pub fn new_array(&mut self) {
        self.buffer.push(b'{');
    }

    pub fn add_array_int(&mut self, value: i64) {
        self.buffer.extend_from_slice(value.to_string().as_bytes());
        self.buffer.push(b',');
    }

    pub fn add_array_str(&mut self, value: &str) {
        self.buffer.push(b'"');
        Self::escape_double_into(&mut self.buffer, value);
        self.buffer.extend_from_slice(b"\",");
    }

    pub fn finish_array(&mut self) {
        if self.buffer.last() == Some(&b'{') {
            self.buffer.push(b'}');
        } else {
            *self.buffer.last_mut().unwrap() = b'}';
        }
        self.buffer.push(b'\t');
    }

    /// Add a key/value pair of an hstore column. The column needs no
    /// start marker; close it with `finish_hash`.
    pub fn add_hash_elem(&mut self, key: &str, value: &str) {
        self.buffer.push(b'"');
        Self::escape_double_into(&mut self.buffer, key);
        self.buffer.extend_from_slice(b"\"=>\"");
        Self::escape_double_into(&mut self.buffer, value);
        self.buffer.extend_from_slice(b"\",");
    }

    pub fn finish_hash(&mut self) {
        if self.buffer.last() == Some(&b',') {
            *self.buffer.last_mut().unwrap() = b'\t';
        } else {
            self.buffer.push(b'\t');
        }
    }

    /// Mark a row for deletion before this buffer is copied.
    pub fn delete_id(&mut self, id: Osmid) {
        match &mut self.deletables {
            Deletables::Ids(v) => v.push(id),
            Deletables::TypedIds(_) => panic!("table uses (type,id) deletes"),
        }
    }

    pub fn delete_typed_id(&mut self, type_: OsmType, id: Osmid) {
        match &mut self.deletables {
            Deletables::TypedIds(v) => v.push((type_, id)),
            Deletables::Ids(v) if v.is_empty() => {
                self.deletables = Deletables::TypedIds(vec![(type_, id)]);
            }
            Deletables::Ids(_) => panic!("table uses plain id deletes"),
        }
    }

    #[cfg(test)]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// A command for the writer thread.
enum Command {
    Copy(CopyBuffer),
    /// Barrier: the writer ends any open COPY and then signals.
    Sync(mpsc::SyncSender<()>),
    Finish,
}

/// Bounded command queue: mutex plus one condition variable per
/// direction.
struct Queue {
    commands: Mutex<VecDeque<Command>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl Queue {
    fn new() -> Queue {
        Queue {
            commands: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn push(&self, command: Command) {
        let mut commands = self.commands.lock().unwrap();
        while commands.len() >= MAX_BUFFERS {
            commands = self.not_full.wait(commands).unwrap();
        }
        commands.push_back(command);
        self.not_empty.notify_one();
    }

    fn pop(&self) -> Command {
        let mut commands = self.commands.lock().unwrap();
        while commands.is_empty() {
            commands = self.not_empty.wait(commands).unwrap();
        }
        let command = commands.pop_front().unwrap();
        self.not_full.notify_one();
        command
    }
}

/// The worker thread that streams COPY data into the database.
///
/// One per output pipeline. A failure in here is not recoverable by the
/// producers, the process logs and exits with status 2.
pub struct CopyThread {
    queue: Arc<Queue>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CopyThread {
    pub fn new(conninfo: &str) -> CopyThread {
        let queue = Arc::new(Queue::new());
        let worker_queue = queue.clone();
        let conninfo = conninfo.to_string();
        let worker = thread::spawn(move || {
            if let Err(e) = run_copy_thread(&worker_queue, &conninfo) {
                error!("DB copy thread failed: {e}");
                std::process::exit(2);
            }
        });
        CopyThread {
            queue,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn send(&self, buffer: CopyBuffer) {
        if !buffer.is_empty() {
            self.queue.push(Command::Copy(buffer));
        }
    }

    /// Send a sync command and wait until the writer has flushed
    /// everything sent before it.
    pub fn sync_and_wait(&self) {
        let (tx, rx) = mpsc::sync_channel(1);
        self.queue.push(Command::Sync(tx));
        let _ = rx.recv();
    }

    /// Finish the copy process. Only returns when all remaining data has
    /// been committed to the database.
    pub fn finish(&self) {
        let mut worker = self.worker.lock().unwrap();
        if let Some(handle) = worker.take() {
            self.queue.push(Command::Finish);
            let _ = handle.join();
        }
    }
}

impl Drop for CopyThread {
    fn drop(&mut self) {
        self.finish();
    }
}

fn run_copy_thread(
    queue: &Queue,
    conninfo: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut client = Client::connect(conninfo, NoTls)?;
    client.batch_execute("SET synchronous_commit = off")?;
    // The writer only does COPYs, which ignore this, and DELETEs, which
    // benefit from the index even when the planner disagrees.
    client.batch_execute("SET enable_seqscan = off")?;

    let mut pending: Option<Command> = None;
    loop {
        let command = match pending.take() {
            Some(c) => c,
            None => queue.pop(),
        };
        match command {
            Command::Copy(buffer) => {
                if let Some(sql) = buffer.deletables.delete_sql(&buffer.target) {
                    client.batch_execute(&sql)?;
                }

                // Start the COPY and keep it open while following
                // commands can be merged into it.
                let mut writer = client.copy_in(buffer.target.copy_sql().as_str())?;
                writer.write_all(&buffer.buffer)?;
                loop {
                    match queue.pop() {
                        Command::Copy(next)
                            if next.deletables.is_empty()
                                && next.target.same_copy_target(&buffer.target) =>
                        {
                            writer.write_all(&next.buffer)?;
                        }
                        other => {
                            pending = Some(other);
                            break;
                        }
                    }
                }
                writer.finish()?;
            }
            Command::Sync(barrier) => {
                let _ = barrier.send(());
            }
            Command::Finish => break,
        }
    }
    Ok(())
}

/// A database maintenance statement (index, cluster, analyze, drop) to
/// run during postprocessing. Each task opens its own connection so the
/// driver can run them in parallel.
#[derive(Debug, Clone)]
pub struct MaintenanceTask {
    pub conninfo: String,
    pub sql: String,
}

impl MaintenanceTask {
    pub fn run(&self) -> Result<(), postgres::Error> {
        let mut client = Client::connect(&self.conninfo, NoTls)?;
        client.batch_execute("SET synchronous_commit = off")?;
        client.batch_execute(&self.sql)
    }
}

/// Fills and manages copy buffers for one pipeline.
pub struct CopyMgr {
    thread: Arc<CopyThread>,
    current: Option<CopyBuffer>,
}

impl CopyMgr {
    pub fn new(thread: Arc<CopyThread>) -> CopyMgr {
        CopyMgr {
            thread,
            current: None,
        }
    }

    /// Start a new row, switching buffers if the target changed.
    pub fn new_row(&mut self, target: &Arc<TableTarget>) -> &mut CopyBuffer {
        let switch = match &self.current {
            Some(current) => !current.target.same_copy_target(target),
            None => true,
        };
        if switch {
            self.flush();
            self.current = Some(CopyBuffer::new(target.clone()));
        }
        self.current.as_mut().unwrap()
    }

    /// Finish the current row; large buffers move to the writer thread.
    pub fn end_row(&mut self) {
        let buffer = self.current.as_mut().expect("no row started");
        buffer.end_row();
        if buffer.len() > MAX_BUF_SIZE {
            self.flush();
        }
    }

    /// Mark an id for deletion in the given table before any following
    /// rows are inserted.
    pub fn delete_id(&mut self, target: &Arc<TableTarget>, id: Osmid) {
        self.new_row(target).delete_id(id);
    }

    pub fn delete_typed_id(&mut self, target: &Arc<TableTarget>, type_: OsmType, id: Osmid) {
        self.new_row(target).delete_typed_id(type_, id);
    }

    /// Hand the current buffer to the writer thread.
    pub fn flush(&mut self) {
        if let Some(buffer) = self.current.take() {
            self.thread.send(buffer);
        }
    }

    /// Flush and wait until the writer has committed everything.
    pub fn sync(&mut self) {
        self.flush();
        self.thread.sync_and_wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Arc<TableTarget> {
        Arc::new(TableTarget {
            schema: String::new(),
            name: String::from("planet_osm_line"),
            columns: String::from("osm_id,tags,way"),
            id_column: String::from("osm_id"),
        })
    }

    #[test]
    fn copy_sql() {
        assert_eq!(
            "COPY \"planet_osm_line\" (osm_id,tags,way) FROM STDIN",
            target().copy_sql()
        );

        let all = TableTarget {
            schema: String::from("public"),
            name: String::from("t"),
            columns: String::new(),
            id_column: String::from("id"),
        };
        assert_eq!("COPY \"public\".\"t\" FROM STDIN", all.copy_sql());
    }

    #[test]
    fn delete_sql_by_id() {
        let deletables = Deletables::Ids(vec![10, 20, 30]);
        assert_eq!(
            "DELETE FROM \"planet_osm_line\" WHERE osm_id IN (10,20,30)",
            deletables.delete_sql(&target()).unwrap()
        );
        assert_eq!(None, Deletables::Ids(vec![]).delete_sql(&target()));
    }

    #[test]
    fn delete_sql_by_type_and_id() {
        let target = TableTarget {
            schema: String::new(),
            name: String::from("planet_osm_rels"),
            columns: String::new(),
            id_column: String::from("osm_type,osm_id"),
        };
        let deletables =
            Deletables::TypedIds(vec![(OsmType::Node, 1), (OsmType::Way, 2)]);
        assert_eq!(
            "DELETE FROM \"planet_osm_rels\" p USING (VALUES ('N',1),('W',2)) \
             AS v(osm_type, osm_id) WHERE p.osm_type = v.osm_type::char(1) \
             AND p.osm_id = v.osm_id",
            deletables.delete_sql(&target).unwrap()
        );
    }

    #[test]
    fn row_escaping() {
        let mut buffer = CopyBuffer::new(target());
        buffer.add_int(42);
        buffer.add_str("a\tb\nc\\d");
        buffer.add_null();
        buffer.add_bool(true);
        buffer.end_row();
        assert_eq!(b"42\ta\\tb\\nc\\\\d\t\\N\tt\n".as_slice(), buffer.as_bytes());
    }

    #[test]
    fn array_column() {
        let mut buffer = CopyBuffer::new(target());
        buffer.new_array();
        buffer.add_array_int(1);
        buffer.add_array_int(2);
        buffer.finish_array();
        buffer.end_row();
        assert_eq!(b"{1,2}\n".as_slice(), buffer.as_bytes());

        let mut buffer = CopyBuffer::new(target());
        buffer.new_array();
        buffer.finish_array();
        buffer.end_row();
        assert_eq!(b"{}\n".as_slice(), buffer.as_bytes());
    }

    #[test]
    fn array_string_escaping() {
        let mut buffer = CopyBuffer::new(target());
        buffer.new_array();
        buffer.add_array_str("name");
        buffer.add_array_str("say \"hi\"");
        buffer.finish_array();
        buffer.end_row();
        assert_eq!(
            b"{\"name\",\"say \\\\\"hi\\\\\"\"}\n".as_slice(),
            buffer.as_bytes()
        );
    }

    #[test]
    fn hash_column() {
        let mut buffer = CopyBuffer::new(target());
        buffer.add_hash_elem("highway", "primary");
        buffer.add_hash_elem("name", "A1");
        buffer.finish_hash();
        buffer.end_row();
        assert_eq!(
            b"\"highway\"=>\"primary\",\"name\"=>\"A1\"\n".as_slice(),
            buffer.as_bytes()
        );

        let mut buffer = CopyBuffer::new(target());
        buffer.finish_hash();
        buffer.end_row();
        assert_eq!(b"\n".as_slice(), buffer.as_bytes());
    }

    #[test]
    fn hex_geometry_column() {
        let mut buffer = CopyBuffer::new(target());
        buffer.add_hex_geom(&[0x01, 0xab]);
        buffer.end_row();
        assert_eq!(b"01AB\n".as_slice(), buffer.as_bytes());

        // null geometry becomes a NULL column
        let mut buffer = CopyBuffer::new(target());
        buffer.add_hex_geom(&[]);
        buffer.end_row();
        assert_eq!(b"\\N\n".as_slice(), buffer.as_bytes());
    }
}
