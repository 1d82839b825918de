//! Execution strategies.
//!
//! Every strategy turns a stream of chunks into chunk reports using the same
//! [`ChunkProcessor`]; they differ only in scheduling and in how a chunk is
//! validated. Chunks are pulled lazily from a [`ChunkFeed`], so at most one
//! chunk per worker plus a bounded look-ahead is ever resident.
//!
//! | strategy | scheduling | validation |
//! |---|---|---|
//! | `sequential` | one chunk at a time | row-wise |
//! | `thread-parallel` | waves of `worker_count` chunks on a dedicated rayon pool | row-wise |
//! | `process-parallel` | isolated worker threads fed through a bounded channel | row-wise |
//! | `columnar-engine` | one chunk at a time | column-wise |
//! | `distributed-engine` | one chunk at a time | partitions validated in parallel, then merged |

use crate::chunk::Chunk;
use crate::config::ExecutionStrategyKind;
use crate::error::{EtlError, Result};
use crate::report::ChunkReport;
use crate::stage::{ChunkProcessor, ValidationMode};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, error, info, warn};

/// Lazy source of chunks for a strategy, with the run's stop conditions.
///
/// Scheduling stops when the source is exhausted, when it fails, when the
/// cancel token is set, or (with fail-fast) after the first chunk that ends
/// in a terminal failure. Chunks already handed out are never recalled.
pub struct ChunkFeed<'a> {
    chunks: Box<dyn Iterator<Item = Result<Chunk>> + 'a>,
    cancel: Arc<AtomicBool>,
    fail_fast: bool,
    cancelled: bool,
    aborted: bool,
    fatal: Option<EtlError>,
}

/// How a feed ended.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    /// Cancellation was requested before the source was exhausted.
    pub cancelled: bool,
    /// Fail-fast stopped scheduling after a terminal chunk failure.
    pub aborted: bool,
    /// Source error that ended the stream early.
    pub fatal: Option<EtlError>,
}

impl<'a> ChunkFeed<'a> {
    /// Feed over `chunks` that stops once `cancel` is set.
    pub fn new(chunks: impl Iterator<Item = Result<Chunk>> + 'a, cancel: Arc<AtomicBool>) -> Self {
        Self {
            chunks: Box::new(chunks),
            cancel,
            fail_fast: false,
            cancelled: false,
            aborted: false,
            fatal: None,
        }
    }

    /// Stop handing out chunks after the first terminal failure.
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Next chunk to schedule, or `None` once scheduling has stopped.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        if self.is_stopped() {
            return None;
        }
        if self.cancel.load(Ordering::SeqCst) {
            info!("cancel requested, no further chunks will be scheduled");
            self.cancelled = true;
            return None;
        }
        match self.chunks.next()? {
            Ok(chunk) => Some(chunk),
            Err(err) => {
                error!(error = %err, "source failed, no further chunks will be scheduled");
                self.fatal = Some(err);
                None
            }
        }
    }

    /// Up to `n` chunks.
    pub fn next_wave(&mut self, n: usize) -> Vec<Chunk> {
        let mut wave = Vec::with_capacity(n);
        while wave.len() < n {
            match self.next_chunk() {
                Some(chunk) => wave.push(chunk),
                None => break,
            }
        }
        wave
    }

    /// Account for a finished chunk.
    pub fn observe(&mut self, report: &ChunkReport) {
        if self.fail_fast && !self.aborted && report.state.is_failure() {
            warn!(
                chunk_seq = report.seq,
                state = ?report.state,
                "fail-fast: stopping after terminal chunk failure"
            );
            self.aborted = true;
        }
    }

    /// Whether the feed will hand out no more chunks.
    pub fn is_stopped(&self) -> bool {
        self.cancelled || self.aborted || self.fatal.is_some()
    }

    /// Why the feed stopped, if it did.
    pub fn into_outcome(self) -> FeedOutcome {
        FeedOutcome {
            cancelled: self.cancelled,
            aborted: self.aborted,
            fatal: self.fatal,
        }
    }
}

/// A way of scheduling chunk processing.
pub trait ExecutionStrategy: Send + Sync {
    fn kind(&self) -> ExecutionStrategyKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn processor(&self) -> &ChunkProcessor;

    /// Take one chunk to a terminal state.
    fn process_chunk(&self, chunk: &Chunk) -> ChunkReport {
        self.processor().process_chunk(chunk)
    }

    /// Drain `feed`, returning one report per scheduled chunk in any order.
    fn dispatch(&self, feed: &mut ChunkFeed<'_>) -> Vec<ChunkReport> {
        let mut reports = Vec::new();
        while let Some(chunk) = feed.next_chunk() {
            let report = self.process_chunk(&chunk);
            feed.observe(&report);
            reports.push(report);
        }
        reports
    }
}

/// Single-threaded, in-order processing.
#[derive(Debug, Clone)]
pub struct Sequential {
    processor: ChunkProcessor,
}

impl Sequential {
    /// Process chunks one at a time on the calling thread.
    pub fn new(processor: ChunkProcessor) -> Self {
        Self {
            processor: processor.with_mode(ValidationMode::RowWise),
        }
    }
}

impl ExecutionStrategy for Sequential {
    fn kind(&self) -> ExecutionStrategyKind {
        ExecutionStrategyKind::Sequential
    }

    fn processor(&self) -> &ChunkProcessor {
        &self.processor
    }
}

/// Waves of chunks processed on a dedicated rayon pool.
pub struct ThreadParallel {
    processor: ChunkProcessor,
    pool: rayon::ThreadPool,
    workers: usize,
}

impl std::fmt::Debug for ThreadParallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadParallel")
            .field("processor", &self.processor)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl ThreadParallel {
    /// # Errors
    /// [`EtlError::Config`] if the worker pool cannot be built.
    pub fn new(processor: ChunkProcessor, workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ironload-worker-{i}"))
            .build()
            .map_err(|e| EtlError::Config(format!("cannot build worker pool: {e}")))?;
        Ok(Self {
            processor: processor.with_mode(ValidationMode::RowWise),
            pool,
            workers,
        })
    }
}

impl ExecutionStrategy for ThreadParallel {
    fn kind(&self) -> ExecutionStrategyKind {
        ExecutionStrategyKind::ThreadParallel
    }

    fn processor(&self) -> &ChunkProcessor {
        &self.processor
    }

    fn dispatch(&self, feed: &mut ChunkFeed<'_>) -> Vec<ChunkReport> {
        let mut reports = Vec::new();
        loop {
            let wave = feed.next_wave(self.workers);
            if wave.is_empty() {
                break;
            }
            debug!(chunks = wave.len(), "dispatching wave");
            let done: Vec<ChunkReport> = self
                .pool
                .install(|| wave.par_iter().map(|c| self.process_chunk(c)).collect());
            for report in done {
                feed.observe(&report);
                reports.push(report);
            }
        }
        reports
    }
}

/// Isolated workers fed through a bounded channel.
///
/// Workers own nothing but their current chunk; they share only the sink and
/// the run metrics. Completion order is arbitrary.
#[derive(Debug, Clone)]
pub struct ProcessParallel {
    processor: ChunkProcessor,
    workers: usize,
}

impl ProcessParallel {
    /// `workers` isolated threads fed through a bounded channel.
    pub fn new(processor: ChunkProcessor, workers: usize) -> Self {
        Self {
            processor: processor.with_mode(ValidationMode::RowWise),
            workers: workers.max(1),
        }
    }
}

fn worker_loop(id: usize, processor: &ChunkProcessor, tasks: &Mutex<Receiver<Chunk>>, done: mpsc::Sender<ChunkReport>) {
    loop {
        let next = tasks.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(chunk) = next else {
            break;
        };
        debug!(worker = id, chunk_seq = chunk.seq, "worker picked up chunk");
        if done.send(processor.process_chunk(&chunk)).is_err() {
            break;
        }
    }
}

impl ExecutionStrategy for ProcessParallel {
    fn kind(&self) -> ExecutionStrategyKind {
        ExecutionStrategyKind::ProcessParallel
    }

    fn processor(&self) -> &ChunkProcessor {
        &self.processor
    }

    fn dispatch(&self, feed: &mut ChunkFeed<'_>) -> Vec<ChunkReport> {
        let (task_tx, task_rx) = mpsc::sync_channel::<Chunk>(self.workers);
        let task_rx = Mutex::new(task_rx);
        let (done_tx, done_rx) = mpsc::channel::<ChunkReport>();
        let mut reports = Vec::new();

        thread::scope(|scope| {
            for id in 0..self.workers {
                let done = done_tx.clone();
                let tasks = &task_rx;
                let processor = &self.processor;
                scope.spawn(move || worker_loop(id, processor, tasks, done));
            }
            drop(done_tx);

            loop {
                for report in done_rx.try_iter() {
                    feed.observe(&report);
                    reports.push(report);
                }
                let Some(chunk) = feed.next_chunk() else {
                    break;
                };
                if task_tx.send(chunk).is_err() {
                    break;
                }
            }
            drop(task_tx);

            for report in done_rx.iter() {
                feed.observe(&report);
                reports.push(report);
            }
        });
        reports
    }
}

/// Sequential scheduling with column-at-a-time validation.
#[derive(Debug, Clone)]
pub struct ColumnarEngine {
    processor: ChunkProcessor,
}

impl ColumnarEngine {
    /// Row-wise processing replaced by a column-at-a-time pass.
    pub fn new(processor: ChunkProcessor) -> Self {
        Self {
            processor: processor.with_mode(ValidationMode::Columnar),
        }
    }
}

impl ExecutionStrategy for ColumnarEngine {
    fn kind(&self) -> ExecutionStrategyKind {
        ExecutionStrategyKind::ColumnarEngine
    }

    fn processor(&self) -> &ChunkProcessor {
        &self.processor
    }
}

/// Each chunk is split into partitions that are validated in parallel and
/// merged before a single gate decision and load.
#[derive(Debug, Clone)]
pub struct DistributedEngine {
    processor: ChunkProcessor,
}

impl DistributedEngine {
    /// Split each chunk into `partitions` parts validated on the rayon pool.
    pub fn new(processor: ChunkProcessor, partitions: usize) -> Self {
        Self {
            processor: processor.with_mode(ValidationMode::Partitioned {
                partitions: partitions.max(1),
            }),
        }
    }
}

impl ExecutionStrategy for DistributedEngine {
    fn kind(&self) -> ExecutionStrategyKind {
        ExecutionStrategyKind::DistributedEngine
    }

    fn processor(&self) -> &ChunkProcessor {
        &self.processor
    }
}

/// Build the strategy for `kind`.
///
/// # Errors
/// [`EtlError::Config`] for a zero worker count or an unbuildable pool.
pub fn build_strategy(
    kind: ExecutionStrategyKind,
    processor: ChunkProcessor,
    worker_count: usize,
) -> Result<Box<dyn ExecutionStrategy>> {
    if worker_count == 0 {
        return Err(EtlError::Config("worker_count must be at least 1".into()));
    }
    Ok(match kind {
        ExecutionStrategyKind::Sequential => Box::new(Sequential::new(processor)),
        ExecutionStrategyKind::ThreadParallel => Box::new(ThreadParallel::new(processor, worker_count)?),
        ExecutionStrategyKind::ProcessParallel => Box::new(ProcessParallel::new(processor, worker_count)),
        ExecutionStrategyKind::ColumnarEngine => Box::new(ColumnarEngine::new(processor)),
        ExecutionStrategyKind::DistributedEngine => {
            Box::new(DistributedEngine::new(processor, worker_count))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EtlConfig;
    use crate::metrics::RunMetrics;
    use crate::record::{RawFields, RawRecord, SourceFormat};
    use crate::report::ChunkState;
    use crate::chunk::ChunkEntry;
    use crate::retry::NoopSleeper;
    use crate::sink::{LoadSink, MemorySink};
    use crate::testing::FailingSink;
    use serde_json::json;

    fn chunks(n: u64) -> Vec<Result<Chunk>> {
        (0..n)
            .map(|seq| {
                let serde_json::Value::Object(map) = json!({
                    "request_id": format!("r{seq}"),
                    "timestamp": "2024-05-01 10:00:00",
                    "endpoint": "/a",
                    "status_code": 200,
                    "response_time": 1,
                }) else {
                    unreachable!()
                };
                let entry = ChunkEntry::Record(RawRecord {
                    line: seq + 1,
                    offset: seq * 10,
                    len: 10,
                    fields: RawFields::Object(map),
                });
                Ok(Chunk::new(seq, SourceFormat::Logs, vec![entry]))
            })
            .collect()
    }

    fn processor(sink: Arc<dyn LoadSink>) -> ChunkProcessor {
        ChunkProcessor::new(&EtlConfig::default(), sink, Arc::new(RunMetrics::new()))
            .unwrap()
            .with_sleeper(Arc::new(NoopSleeper))
    }

    #[test]
    fn every_strategy_processes_every_chunk() {
        for kind in ExecutionStrategyKind::ALL {
            let sink = Arc::new(MemorySink::new());
            let strategy = build_strategy(kind, processor(sink.clone()), 3).unwrap();
            let mut feed = ChunkFeed::new(chunks(7).into_iter(), Arc::default());
            let mut reports = strategy.dispatch(&mut feed);
            reports.sort_by_key(|r| r.seq);
            assert_eq!(reports.len(), 7, "{kind}");
            assert!(reports.iter().all(|r| r.state == ChunkState::Loaded), "{kind}");
            assert_eq!(sink.row_count().unwrap(), 7, "{kind}");
            assert_eq!(strategy.name(), kind.as_str());
        }
    }

    #[test]
    fn cancel_stops_scheduling() {
        let cancel = Arc::new(AtomicBool::new(true));
        let strategy = Sequential::new(processor(Arc::new(MemorySink::new())));
        let mut feed = ChunkFeed::new(chunks(3).into_iter(), cancel);
        assert!(strategy.dispatch(&mut feed).is_empty());
        assert!(feed.into_outcome().cancelled);
    }

    #[test]
    fn fail_fast_aborts_after_first_load_failure() {
        let strategy = Sequential::new(processor(Arc::new(FailingSink::default())));
        let mut feed = ChunkFeed::new(chunks(5).into_iter(), Arc::default()).fail_fast(true);
        let reports = strategy.dispatch(&mut feed);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, ChunkState::LoadFailed);
        assert!(feed.into_outcome().aborted);
    }

    #[test]
    fn source_error_is_kept_as_fatal() {
        let mut items = chunks(2);
        items.push(Err(EtlError::io(
            "in.jsonl.gz",
            std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt deflate stream"),
        )));
        let strategy = ProcessParallel::new(processor(Arc::new(MemorySink::new())), 2);
        let mut feed = ChunkFeed::new(items.into_iter(), Arc::default());
        assert_eq!(strategy.dispatch(&mut feed).len(), 2);
        assert!(matches!(feed.into_outcome().fatal, Some(EtlError::Io { .. })));
    }
}
