//! Processing driver
//!
//! Stage 1a feeds objects into the middle and the outputs on a single
//! thread. After input EOF, stage 1b re-emits the parents of changed
//! objects on a pool of worker threads, each with its own middle handle,
//! COPY thread and database connection; stage 1c pushes way marks made
//! in 1b back through the dependency manager; stage 2 reprocesses
//! whatever the outputs marked themselves. Postprocessing then runs the
//! maintenance SQL on a bounded pool and the merged expiry tree is
//! written out.

use log::{info, warn};
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::copy::{CopyThread, MaintenanceTask};
use crate::deps::DependencyManager;
use crate::expire::ExpireTiles;
use crate::middle::{self, Middle, MiddleRead};
use crate::options::Options;
use crate::osm::{Action, Node, Osmid, Relation, Way, MAX_RELATION_MEMBERS};
use crate::output::{self, Output};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Middle(#[from] middle::Error),
    #[error(transparent)]
    Output(#[from] output::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("worker thread panicked")]
    WorkerPanic,
    #[error("cannot build maintenance thread pool: {0}")]
    Pool(String),
}

pub struct Osmdata {
    middle: Box<dyn Middle>,
    outputs: Vec<Box<dyn Output>>,
    deps: DependencyManager,
    opts: Options,
}

impl Osmdata {
    pub fn new(middle: Box<dyn Middle>, outputs: Vec<Box<dyn Output>>, opts: Options) -> Osmdata {
        Osmdata {
            middle,
            outputs,
            deps: DependencyManager::new(),
            opts,
        }
    }

    /// Prepare all outputs (table creation etc).
    pub fn start(&mut self) -> Result<(), Error> {
        for out in &mut self.outputs {
            out.start()?;
        }
        Ok(())
    }

    fn notify_node(&mut self, id: Osmid) -> Result<(), Error> {
        if let Some(refs) = self.middle.backrefs() {
            self.deps.node_changed(id, refs)?;
        }
        Ok(())
    }

    fn notify_way(&mut self, id: Osmid) -> Result<(), Error> {
        if let Some(refs) = self.middle.backrefs() {
            self.deps.way_changed(id, refs)?;
        }
        Ok(())
    }

    pub fn node(&mut self, node: &Node, action: Action) -> Result<(), Error> {
        if action != Action::Delete {
            if !node.location_valid() {
                warn!("ignored node {} with invalid location", node.id);
                return Ok(());
            }
            if let Some(bbox) = &self.opts.bbox {
                if !bbox.contains(node.lon(), node.lat()) {
                    return Ok(());
                }
            }
        }

        match action {
            Action::Delete => {
                self.middle.delete_node(node.id)?;
                for out in &mut self.outputs {
                    out.node_delete(node.id)?;
                }
                self.notify_node(node.id)?;
            }
            _ if self.opts.append => {
                self.middle.put_node(node.id, node.lon(), node.lat())?;
                self.notify_node(node.id)?;
                for out in &mut self.outputs {
                    out.node_modify(node)?;
                }
            }
            _ => {
                self.middle.put_node(node.id, node.lon(), node.lat())?;
                for out in &mut self.outputs {
                    out.node_add(node)?;
                }
            }
        }
        Ok(())
    }

    pub fn way(&mut self, way: &Way, action: Action) -> Result<(), Error> {
        match action {
            Action::Delete => {
                self.middle.delete_way(way.id)?;
                for out in &mut self.outputs {
                    out.way_delete(way.id)?;
                }
                self.notify_way(way.id)?;
            }
            _ if self.opts.append => {
                self.middle
                    .put_way(way.id, way.tags.clone(), way.nodes.clone())?;
                self.notify_way(way.id)?;
                let Osmdata {
                    middle, outputs, ..
                } = self;
                for out in outputs {
                    out.way_modify(way, middle.as_read())?;
                }
            }
            _ => {
                self.middle
                    .put_way(way.id, way.tags.clone(), way.nodes.clone())?;
                let Osmdata {
                    middle, outputs, ..
                } = self;
                for out in outputs {
                    out.way_add(way, middle.as_read())?;
                }
            }
        }
        Ok(())
    }

    pub fn relation(&mut self, rel: &Relation, action: Action) -> Result<(), Error> {
        match action {
            Action::Delete => {
                self.middle.delete_relation(rel.id)?;
                for out in &mut self.outputs {
                    out.relation_delete(rel.id)?;
                }
            }
            _ => {
                self.middle
                    .put_relation(rel.id, rel.tags.clone(), rel.members.clone())?;
                if rel.members.len() > MAX_RELATION_MEMBERS {
                    warn!(
                        "dropped relation {} with {} members (limit {MAX_RELATION_MEMBERS})",
                        rel.id,
                        rel.members.len()
                    );
                    return Ok(());
                }
                let append = self.opts.append;
                let Osmdata {
                    middle, outputs, ..
                } = self;
                for out in outputs {
                    if append {
                        out.relation_modify(rel, middle.as_read())?;
                    } else {
                        out.relation_add(rel, middle.as_read())?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn after_nodes(&mut self) -> Result<(), Error> {
        Ok(self.middle.after_nodes()?)
    }

    pub fn after_ways(&mut self) -> Result<(), Error> {
        Ok(self.middle.after_ways()?)
    }

    pub fn after_relations(&mut self) -> Result<(), Error> {
        Ok(self.middle.after_relations()?)
    }

    /// Run the pending stages, stage 2, database postprocessing and the
    /// expiry output. Consumes the driver.
    pub fn finish(mut self) -> Result<(), Error> {
        for out in &mut self.outputs {
            out.sync();
        }

        let Osmdata {
            mut middle,
            mut outputs,
            mut deps,
            opts,
        } = self;

        if opts.append && opts.with_forward_dependencies {
            process_dependents(&*middle, &mut outputs, &mut deps, &opts)?;
        }

        // stage 2: reprocess objects the outputs marked during stage 1
        for out in &mut outputs {
            out.reprocess_marked(middle.as_read())?;
        }
        for out in &mut outputs {
            out.sync();
        }

        postprocess(&mut *middle, &mut outputs, &opts)?;

        write_expiry_file(&mut outputs, &opts)?;

        Ok(())
    }
}

/// One worker's private pipeline: a middle handle, clones of all
/// outputs, and the COPY thread they write through.
struct WorkerClone<'a> {
    mid: Box<dyn MiddleRead + Send + 'a>,
    outs: Vec<Box<dyn Output>>,
    _copy: Arc<CopyThread>,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Way,
    Relation,
    RelationStage1c,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Way => "way",
            Stage::Relation | Stage::RelationStage1c => "relation",
        }
    }
}

/// Stages 1b and 1c.
fn process_dependents(
    middle: &dyn Middle,
    outputs: &mut [Box<dyn Output>],
    deps: &mut DependencyManager,
    opts: &Options,
) -> Result<(), Error> {
    let mut clones: Vec<WorkerClone> = Vec::with_capacity(opts.num_procs);
    for _ in 0..opts.num_procs {
        let mid = middle.query_handle()?;
        let copy = Arc::new(CopyThread::new(&opts.conninfo));
        let outs: Vec<Box<dyn Output>> = outputs
            .iter()
            .map(|out| out.clone_for_worker(&copy))
            .collect::<Result<_, _>>()?;
        clones.push(WorkerClone {
            mid,
            outs,
            _copy: copy,
        });
    }

    // stage 1b: parents of changed objects
    if deps.has_pending() {
        process_queue(&mut clones, deps.drain_pending_way_ids(), Stage::Way)?;
        process_queue(
            &mut clones,
            deps.drain_pending_relation_ids(),
            Stage::Relation,
        )?;
    }

    // stage 1c: ways marked during 1b make their parent relations
    // pending
    if let Some(refs) = middle.backrefs() {
        for clone in &mut clones {
            for out in &mut clone.outs {
                for id in out.take_marked_way_ids() {
                    deps.way_changed(id, refs)?;
                }
            }
        }
        for out in outputs.iter_mut() {
            for id in out.take_marked_way_ids() {
                deps.way_changed(id, refs)?;
            }
        }
    }
    if deps.has_pending() {
        process_queue(
            &mut clones,
            deps.drain_pending_relation_ids(),
            Stage::RelationStage1c,
        )?;
    }

    // fold the workers' expiry trees back into the main outputs
    for clone in clones {
        for (main, mut worker) in outputs.iter_mut().zip(clone.outs) {
            if let Some(tree) = worker.take_expire_tree() {
                main.merge_expire_tree(tree);
            }
        }
    }

    Ok(())
}

/// Fan a list of ids out to the worker clones. Each worker pops one id
/// at a time from a shared stack; a progress line is printed once per
/// second until the stack is empty.
fn process_queue(
    clones: &mut [WorkerClone],
    ids: Vec<Osmid>,
    stage: Stage,
) -> Result<(), Error> {
    let total = ids.len();
    info!(
        "going over {total} pending {}s (using {} threads)",
        stage.name(),
        clones.len()
    );

    let queue = Mutex::new(ids);
    let result = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(clones.len());
        for clone in clones.iter_mut() {
            let queue = &queue;
            handles.push(scope.spawn(move || worker_loop(queue, clone, stage)));
        }

        let progress = scope.spawn(|| loop {
            let left = queue.lock().unwrap().len();
            if left == 0 {
                break;
            }
            eprint!("\rLeft to process: {left}...");
            thread::sleep(Duration::from_secs(1));
        });

        let mut result = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(_) => {
                    queue.lock().unwrap().clear();
                    if result.is_ok() {
                        result = Err(Error::WorkerPanic);
                    }
                }
            }
        }
        let _ = progress.join();
        result
    });

    info!("processed {total} pending {}s", stage.name());
    result
}

fn worker_loop(
    queue: &Mutex<Vec<Osmid>>,
    clone: &mut WorkerClone,
    stage: Stage,
) -> Result<(), Error> {
    let result = drain_queue(queue, clone, stage);
    if result.is_err() {
        // let the sibling workers exit fast
        queue.lock().unwrap().clear();
    }
    result
}

fn drain_queue(
    queue: &Mutex<Vec<Osmid>>,
    clone: &mut WorkerClone,
    stage: Stage,
) -> Result<(), Error> {
    loop {
        let id = queue.lock().unwrap().pop();
        let Some(id) = id else {
            break;
        };
        for out in &mut clone.outs {
            match stage {
                Stage::Way => out.pending_way(id, &*clone.mid)?,
                Stage::Relation => out.pending_relation(id, &*clone.mid)?,
                Stage::RelationStage1c => out.pending_relation_stage1c(id, &*clone.mid)?,
            }
        }
    }
    for out in &mut clone.outs {
        out.sync();
    }
    Ok(())
}

/// Cluster/index/analyze the output tables and drop or index the middle
/// tables, in parallel on a bounded pool.
fn postprocess(
    middle: &mut dyn Middle,
    outputs: &mut [Box<dyn Output>],
    opts: &Options,
) -> Result<(), Error> {
    let num_threads = if opts.parallel_indexing {
        opts.num_procs
    } else {
        1
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| Error::Pool(e.to_string()))?;

    let middle_tasks = middle.stop(opts.droptemp)?;
    let mut output_tasks = Vec::new();
    for out in outputs.iter_mut() {
        output_tasks.extend(out.stop()?);
    }

    // when dropping the middle tables, get rid of them before the output
    // indexing competes for I/O; otherwise index the outputs first
    let batches = if opts.droptemp {
        [middle_tasks, output_tasks]
    } else {
        [output_tasks, middle_tasks]
    };
    for batch in batches {
        run_maintenance(&pool, &batch)?;
    }
    Ok(())
}

fn run_maintenance(pool: &rayon::ThreadPool, tasks: &[MaintenanceTask]) -> Result<(), Error> {
    let errors: Mutex<Vec<postgres::Error>> = Mutex::new(Vec::new());
    pool.scope(|scope| {
        for task in tasks {
            let errors = &errors;
            scope.spawn(move |_| {
                info!("running: {}", task.sql);
                if let Err(e) = task.run() {
                    errors.lock().unwrap().push(e);
                }
            });
        }
    });
    match errors.into_inner().unwrap().into_iter().next() {
        Some(e) => Err(Error::Output(output::Error::Database(e))),
        None => Ok(()),
    }
}

/// Take the expiry trees of all outputs, union them and append the
/// dirty-tile list to the configured file.
fn write_expiry_file(outputs: &mut [Box<dyn Output>], opts: &Options) -> Result<(), Error> {
    if opts.expire_tiles_zoom.is_none() {
        return Ok(());
    }

    let mut combined: Option<ExpireTiles> = None;
    for out in outputs.iter_mut() {
        if let Some(tree) = out.take_expire_tree() {
            match &mut combined {
                Some(all) => all.merge(tree),
                None => combined = Some(tree),
            }
        }
    }

    if let Some(tree) = combined {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&opts.expire_output)?;
        let mut writer = BufWriter::new(file);
        tree.output_and_destroy(&mut writer, opts.expire_tiles_zoom_min)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ram::RamMiddle;
    use crate::options::DEFAULT_SCALE;
    use crate::osm::Tags;
    use crate::output::null::NullOutput;

    fn node(id: Osmid, lon: f64, lat: f64) -> Node {
        Node {
            id,
            decimicro_lon: crate::osm::coord_to_decimicro(lon),
            decimicro_lat: crate::osm::coord_to_decimicro(lat),
            tags: Tags::new(),
        }
    }

    fn driver(opts: Options) -> Osmdata {
        Osmdata::new(
            Box::new(RamMiddle::new(DEFAULT_SCALE)),
            vec![Box::new(NullOutput)],
            opts,
        )
    }

    #[test]
    fn bbox_filters_nodes() {
        let opts = Options {
            bbox: Some("0,0,10,10".parse().unwrap()),
            ..Default::default()
        };
        let mut data = driver(opts);

        data.node(&node(1, 5.0, 5.0), Action::Create).unwrap();
        data.node(&node(2, 20.0, 20.0), Action::Create).unwrap();

        assert!(data.middle.node(1).is_some());
        assert!(data.middle.node(2).is_none());
    }

    #[test]
    fn invalid_location_skipped() {
        let mut data = driver(Options::default());
        data.node(&node(1, 200.0, 95.0), Action::Create).unwrap();
        assert!(data.middle.node(1).is_none());
    }

    #[test]
    fn oversized_relation_cached_but_not_output() {
        let mut data = driver(Options::default());

        let members: Vec<crate::osm::Member> = (0..=MAX_RELATION_MEMBERS as i64)
            .map(|i| crate::osm::Member {
                ref_: i,
                role: String::new(),
                type_: crate::osm::OsmType::Node,
            })
            .collect();
        let mut tags = Tags::new();
        tags.insert("type", "multipolygon");
        let rel = Relation {
            id: 9,
            members,
            tags,
        };
        data.relation(&rel, Action::Create).unwrap();

        // the middle write happens before the cap check
        assert!(data.middle.relation(9).is_some());
    }

    #[test]
    fn ingest_and_finish_without_database() {
        let mut data = driver(Options::default());

        data.node(&node(1, 0.0, 0.0), Action::Create).unwrap();
        data.node(&node(2, 1.0, 1.0), Action::Create).unwrap();
        data.after_nodes().unwrap();
        data.way(
            &Way {
                id: 10,
                nodes: vec![1, 2],
                tags: Tags::new(),
            },
            Action::Create,
        )
        .unwrap();
        data.after_ways().unwrap();
        data.after_relations().unwrap();

        data.finish().unwrap();
    }
}
