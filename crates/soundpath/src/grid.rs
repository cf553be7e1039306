//! Grid scheduler and output sinks.
//!
//! The scene envelope is split into `4^level` square cells. Each cell is one
//! job: build the spatial index of the cell (grown by the maximum source
//! distance so cross-border geometry is seen), then trace every path between
//! the receivers inside the cell and the sources in range. A bounded job
//! queue gives backpressure on submission; a single writer thread drains the
//! result channel so sinks never need to be thread safe.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, SoundPathError};
use crate::geom::{Coord, Envelope};
use crate::index::SceneIndex;
use crate::path::{find_paths_with, PathConfig, PathKind, PropagationPath};
use crate::reflection::MirrorReceiverIndex;
use crate::scene::SceneBuilder;

/// A point noise source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Source {
    pub id: usize,
    pub position: Coord,
}

/// A receiver position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Receiver {
    pub id: usize,
    pub position: Coord,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Subdivision level: the scene splits into `4^grid_level` cells.
    pub grid_level: usize,
    /// Sources beyond this distance from a receiver are ignored.
    pub max_source_dist: f64,
    /// Worker threads. Zero picks the number of logical CPUs.
    pub threads: usize,
    pub path: PathConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_level: 2,
            max_source_dist: 250.0,
            threads: 0,
            path: PathConfig::default(),
        }
    }
}

/// Counters of one scheduler run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub cells: usize,
    pub cells_done: usize,
    /// Cells whose index could not be built; their pairs are skipped.
    pub cells_failed: usize,
    pub pairs: usize,
    pub paths: usize,
    pub paths_direct: usize,
    pub paths_diffracted_h: usize,
    pub paths_diffracted_v: usize,
    pub paths_reflected: usize,
    pub cancelled: bool,
}

#[derive(Default)]
struct Counters {
    cells_done: AtomicUsize,
    cells_failed: AtomicUsize,
    pairs: AtomicUsize,
    paths: AtomicUsize,
    direct: AtomicUsize,
    diffracted_h: AtomicUsize,
    diffracted_v: AtomicUsize,
    reflected: AtomicUsize,
}

impl Counters {
    fn count_path(&self, kind: PathKind) {
        self.paths.fetch_add(1, Ordering::Relaxed);
        let slot = match kind {
            PathKind::Direct => &self.direct,
            PathKind::DiffractionH => &self.diffracted_h,
            PathKind::DiffractionV => &self.diffracted_v,
            PathKind::Reflection => &self.reflected,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cooperative cancellation flag, checked between receivers and cells.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Consumer of computed paths. Driven by the single writer thread, so
/// implementations need `Send` but never `Sync`.
pub trait PathSink: Send {
    fn write(&mut self, receiver: usize, source: usize, path: &PropagationPath) -> Result<()>;

    /// Called once after the last path, even on cancellation.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One path record per line, as JSON.
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
}

#[derive(Serialize)]
struct PathRecord<'a> {
    receiver: usize,
    source: usize,
    path: &'a PropagationPath,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> PathSink for JsonLinesSink<W> {
    fn write(&mut self, receiver: usize, source: usize, path: &PropagationPath) -> Result<()> {
        let record = PathRecord {
            receiver,
            source,
            path,
        };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// GeoJSON `FeatureCollection` of path geometries, one `LineString` feature
/// per path, buffered and written on [`PathSink::finish`].
pub struct GeoJsonSink<W: Write + Send> {
    out: W,
    features: Vec<serde_json::Value>,
}

impl<W: Write + Send> GeoJsonSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            features: Vec::new(),
        }
    }
}

impl<W: Write + Send> PathSink for GeoJsonSink<W> {
    fn write(&mut self, receiver: usize, source: usize, path: &PropagationPath) -> Result<()> {
        let coords: Vec<[f64; 3]> = path
            .points
            .iter()
            .map(|p| [p.coord.x, p.coord.y, p.coord.z])
            .collect();
        self.features.push(json!({
            "type": "Feature",
            "geometry": { "type": "LineString", "coordinates": coords },
            "properties": {
                "receiver": receiver,
                "source": source,
                "kind": path.kind,
                "length": path.length(),
                "favorable_length": path.favorable_length(),
            },
        }));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let collection = json!({
            "type": "FeatureCollection",
            "features": self.features,
        });
        serde_json::to_writer(&mut self.out, &collection)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Collects everything in memory. Meant for tests and small scenes.
#[derive(Default)]
pub struct MemorySink {
    pub records: Vec<(usize, usize, PropagationPath)>,
}

impl PathSink for MemorySink {
    fn write(&mut self, receiver: usize, source: usize, path: &PropagationPath) -> Result<()> {
        self.records.push((receiver, source, path.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    envelope: Envelope,
}

/// Half-open cell membership: a receiver on an interior cell boundary
/// belongs to exactly one cell. The scene's outer max edges stay inclusive.
fn cell_owns(cell: &Envelope, scene: &Envelope, p: &Coord) -> bool {
    let x_ok = p.x >= cell.min_x
        && (p.x < cell.max_x || (cell.max_x >= scene.max_x && p.x <= cell.max_x));
    let y_ok = p.y >= cell.min_y
        && (p.y < cell.max_y || (cell.max_y >= scene.max_y && p.y <= cell.max_y));
    x_ok && y_ok
}

/// Bounded FIFO of pending cells. Submission blocks while the queue is
/// full, which is the backpressure of the whole pipeline.
struct JobQueue {
    state: Mutex<JobQueueState>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

struct JobQueueState {
    jobs: VecDeque<Cell>,
    closed: bool,
}

impl JobQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(JobQueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, cell: Cell) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.jobs.len() >= self.capacity && !state.closed {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        if !state.closed {
            state.jobs.push_back(cell);
            self.not_empty.notify_one();
        }
    }

    fn pop(&self) -> Option<Cell> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(cell) = state.jobs.pop_front() {
                self.not_full.notify_one();
                return Some(cell);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// All results of one receiver, grouped per source. One message per
/// receiver keeps the output stream contiguous per receiver even though
/// receivers are traced concurrently.
enum Msg {
    Receiver {
        receiver: usize,
        pairs: Vec<(usize, Vec<PropagationPath>)>,
    },
}

/// Run the full grid over the scene.
///
/// Splits the envelope into cells, traces all paths cell by cell on a
/// worker pool, and streams results to `sink` from a dedicated writer
/// thread. Cancelling through `cancel` stops cleanly between receivers; the
/// paths already computed are flushed and the partial [`RunStats`] is
/// returned with `cancelled` set.
pub fn run<S: PathSink>(
    builder: &SceneBuilder,
    sources: &[Source],
    receivers: &[Receiver],
    cfg: &GridConfig,
    sink: &mut S,
    cancel: &CancelToken,
) -> Result<RunStats> {
    if cfg.grid_level > 12 {
        return Err(SoundPathError::InvalidConfiguration {
            message: format!("grid level {} exceeds the supported maximum 12", cfg.grid_level),
        });
    }
    if !(cfg.max_source_dist > 0.0) {
        return Err(SoundPathError::InvalidConfiguration {
            message: format!("max source distance must be positive, got {}", cfg.max_source_dist),
        });
    }
    let scene_env = *builder.envelope();
    for r in receivers {
        if !scene_env.contains(&r.position) {
            return Err(SoundPathError::OutOfDomain {
                x: r.position.x,
                y: r.position.y,
            });
        }
    }

    let threads = if cfg.threads == 0 {
        num_cpus::get()
    } else {
        cfg.threads
    };
    let dim = 1usize << cfg.grid_level;

    let queue = JobQueue::new(threads * 2);
    let (tx, rx) = mpsc::channel::<Msg>();
    let counters = Counters::default();
    // Raised by the writer on the first sink error so workers stop early.
    let abort = CancelToken::new();

    info!(
        "grid run: {}x{} cells, {} sources, {} receivers, {} workers",
        dim,
        dim,
        sources.len(),
        receivers.len(),
        threads
    );

    let mut sink_result: Result<()> = Ok(());

    std::thread::scope(|scope| {
        {
            let sink_result = &mut sink_result;
            let abort = abort.clone();
            scope.spawn(move || {
                let mut failed = false;
                for msg in rx {
                    if failed {
                        continue; // drain so workers never block on send
                    }
                    let Msg::Receiver { receiver, pairs } = msg;
                    'batch: for (source, paths) in &pairs {
                        for path in paths {
                            if let Err(e) = sink.write(receiver, *source, path) {
                                *sink_result = Err(e);
                                failed = true;
                                abort.cancel();
                                break 'batch;
                            }
                        }
                    }
                }
                if !failed {
                    *sink_result = sink.finish();
                }
            });
        }

        for _ in 0..threads {
            let tx = tx.clone();
            let queue = &queue;
            let counters = &counters;
            let abort = &abort;
            scope.spawn(move || {
                while let Some(cell) = queue.pop() {
                    if cancel.is_cancelled() || abort.is_cancelled() {
                        continue; // keep draining so submission never stalls
                    }
                    run_cell(
                        builder, sources, receivers, cfg, cancel, abort, &cell, &scene_env, &tx,
                        counters,
                    );
                    counters.cells_done.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        drop(tx);

        let cell_w = scene_env.width() / dim as f64;
        let cell_h = scene_env.height() / dim as f64;
        'submit: for i in 0..dim {
            for j in 0..dim {
                if cancel.is_cancelled() || abort.is_cancelled() {
                    break 'submit;
                }
                let envelope = Envelope::new(
                    scene_env.min_x + i as f64 * cell_w,
                    scene_env.min_y + j as f64 * cell_h,
                    scene_env.min_x + (i + 1) as f64 * cell_w,
                    scene_env.min_y + (j + 1) as f64 * cell_h,
                );
                queue.push(Cell { envelope });
            }
        }
        queue.close();
    });

    sink_result?;

    Ok(RunStats {
        cells: dim * dim,
        cells_done: counters.cells_done.load(Ordering::Relaxed),
        cells_failed: counters.cells_failed.load(Ordering::Relaxed),
        pairs: counters.pairs.load(Ordering::Relaxed),
        paths: counters.paths.load(Ordering::Relaxed),
        paths_direct: counters.direct.load(Ordering::Relaxed),
        paths_diffracted_h: counters.diffracted_h.load(Ordering::Relaxed),
        paths_diffracted_v: counters.diffracted_v.load(Ordering::Relaxed),
        paths_reflected: counters.reflected.load(Ordering::Relaxed),
        cancelled: cancel.is_cancelled(),
    })
}

#[allow(clippy::too_many_arguments)]
fn run_cell(
    builder: &SceneBuilder,
    sources: &[Source],
    receivers: &[Receiver],
    cfg: &GridConfig,
    cancel: &CancelToken,
    abort: &CancelToken,
    cell: &Cell,
    scene_env: &Envelope,
    tx: &mpsc::Sender<Msg>,
    counters: &Counters,
) {
    let cell_receivers: Vec<&Receiver> = receivers
        .iter()
        .filter(|r| cell_owns(&cell.envelope, scene_env, &r.position))
        .collect();
    if cell_receivers.is_empty() {
        return;
    }
    let expanded = cell.envelope.expanded_by(cfg.max_source_dist);
    let cell_sources: Vec<&Source> = sources
        .iter()
        .filter(|s| expanded.contains(&s.position))
        .collect();
    if cell_sources.is_empty() {
        return;
    }

    let index: SceneIndex = match builder.subset(&expanded).build() {
        Ok(index) => index,
        Err(e) => {
            warn!("skipping cell: {e}");
            counters.cells_failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    debug!(
        "cell with {} receivers, {} sources",
        cell_receivers.len(),
        cell_sources.len()
    );

    // Receivers of one cell are independent of each other. Each receiver
    // buffers its results and ships them as one message.
    cell_receivers
        .par_iter()
        .for_each_with(tx.clone(), |tx, receiver| {
            if cancel.is_cancelled() || abort.is_cancelled() {
                return;
            }
            let mirrors = MirrorReceiverIndex::build(
                &index,
                &receiver.position,
                cfg.path.reflection_order,
                cfg.path.max_reflection_dist,
            );
            let mut pairs: Vec<(usize, Vec<PropagationPath>)> = Vec::new();
            for source in &cell_sources {
                if source.position.distance_2d(&receiver.position) > cfg.max_source_dist {
                    continue;
                }
                let found = find_paths_with(
                    &index,
                    &source.position,
                    &receiver.position,
                    &cfg.path,
                    &mirrors,
                );
                counters.pairs.fetch_add(1, Ordering::Relaxed);
                for path in &found {
                    counters.count_path(path.kind);
                }
                if !found.is_empty() {
                    pairs.push((source.id, found));
                }
            }
            if !pairs.is_empty() {
                let _ = tx.send(Msg::Receiver {
                    receiver: receiver.id,
                    pairs,
                });
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathKind;

    fn flat_builder() -> SceneBuilder {
        let mut builder = SceneBuilder::new(Envelope::new(0.0, 0.0, 200.0, 200.0));
        builder.add_ground_zone_rect(0.0, 200.0, 0.0, 200.0, 0.5);
        builder
    }

    fn grid_points() -> (Vec<Source>, Vec<Receiver>) {
        let sources = vec![
            Source {
                id: 0,
                position: Coord::new(20.0, 20.0, 1.0),
            },
            Source {
                id: 1,
                position: Coord::new(180.0, 180.0, 1.0),
            },
        ];
        let receivers = vec![
            Receiver {
                id: 10,
                position: Coord::new(100.0, 100.0, 4.0),
            },
            Receiver {
                id: 11,
                position: Coord::new(60.0, 140.0, 4.0),
            },
        ];
        (sources, receivers)
    }

    #[test]
    fn flat_grid_pairs_every_source_and_receiver() {
        let builder = flat_builder();
        let (sources, receivers) = grid_points();
        let cfg = GridConfig {
            grid_level: 1,
            max_source_dist: 500.0,
            threads: 2,
            path: PathConfig {
                reflection_order: 0,
                ..PathConfig::default()
            },
        };
        let mut sink = MemorySink::default();
        let stats = run(
            &builder,
            &sources,
            &receivers,
            &cfg,
            &mut sink,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(stats.cells, 4);
        assert_eq!(stats.cells_done, 4);
        assert!(!stats.cancelled);
        assert_eq!(stats.pairs, 4);
        assert_eq!(stats.paths_direct, 4);
        assert_eq!(sink.records.len(), 4);
        assert!(sink
            .records
            .iter()
            .all(|(_, _, p)| p.kind == PathKind::Direct));
        assert!((sink.records[0].2.segments[0].g_path - 0.5).abs() < 1e-9);
    }

    #[test]
    fn run_is_deterministic() {
        let builder = flat_builder();
        let (sources, receivers) = grid_points();
        let cfg = GridConfig {
            grid_level: 1,
            max_source_dist: 500.0,
            threads: 4,
            path: PathConfig::default(),
        };
        let collect = |threads: usize| {
            let mut cfg = cfg.clone();
            cfg.threads = threads;
            let mut sink = MemorySink::default();
            run(
                &builder,
                &sources,
                &receivers,
                &cfg,
                &mut sink,
                &CancelToken::new(),
            )
            .unwrap();
            let mut keys: Vec<(usize, usize, String)> = sink
                .records
                .iter()
                .map(|(r, s, p)| (*r, *s, serde_json::to_string(p).unwrap()))
                .collect();
            keys.sort();
            keys
        };
        assert_eq!(collect(1), collect(4));
    }

    #[test]
    fn cancelled_run_reports_partial_results() {
        let builder = flat_builder();
        let (sources, receivers) = grid_points();
        let cfg = GridConfig {
            grid_level: 3,
            max_source_dist: 500.0,
            threads: 2,
            path: PathConfig::default(),
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sink = MemorySink::default();
        let stats = run(&builder, &sources, &receivers, &cfg, &mut sink, &cancel).unwrap();
        assert!(stats.cancelled);
        assert!(stats.pairs <= 4);
        assert!(sink.records.len() <= stats.paths);
    }

    #[test]
    fn out_of_range_sources_are_skipped() {
        let builder = flat_builder();
        let (sources, receivers) = grid_points();
        let cfg = GridConfig {
            grid_level: 1,
            max_source_dist: 50.0,
            threads: 1,
            path: PathConfig::default(),
        };
        let mut sink = MemorySink::default();
        let stats = run(
            &builder,
            &sources,
            &receivers,
            &cfg,
            &mut sink,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(stats.pairs, 0);
        assert!(sink.records.is_empty());
    }

    #[test]
    fn receiver_outside_the_scene_is_rejected() {
        let builder = flat_builder();
        let (sources, _) = grid_points();
        let receivers = vec![Receiver {
            id: 0,
            position: Coord::new(999.0, 10.0, 4.0),
        }];
        let mut sink = MemorySink::default();
        let err = run(
            &builder,
            &sources,
            &receivers,
            &GridConfig::default(),
            &mut sink,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::SoundPathError::OutOfDomain { .. }
        ));
    }

    #[test]
    fn nonsensical_configuration_is_rejected() {
        let builder = flat_builder();
        let (sources, receivers) = grid_points();
        let cfg = GridConfig {
            max_source_dist: 0.0,
            ..GridConfig::default()
        };
        let mut sink = MemorySink::default();
        assert!(matches!(
            run(&builder, &sources, &receivers, &cfg, &mut sink, &CancelToken::new()),
            Err(crate::error::SoundPathError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn json_lines_sink_writes_one_record_per_path() {
        let builder = flat_builder();
        let (sources, receivers) = grid_points();
        let cfg = GridConfig {
            grid_level: 0,
            max_source_dist: 500.0,
            threads: 1,
            path: PathConfig::default(),
        };
        let mut sink = JsonLinesSink::new(Vec::new());
        let stats = run(
            &builder,
            &sources,
            &receivers,
            &cfg,
            &mut sink,
            &CancelToken::new(),
        )
        .unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text.lines().count(), stats.paths);
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.get("path").is_some());
        }
    }
}
