//! Run orchestration.
//!
//! An [`Engine`] owns a configuration and a sink and turns one input file
//! into a [`PipelineRunReport`]: open the source (under retry), chunk it,
//! hand the chunks to the configured strategy, and fold the chunk reports.
//!
//! Configuration problems are returned as `Err` before any I/O happens.
//! Everything after that, including an unreadable source, ends up in the
//! report instead.

use crate::chunk::Chunker;
use crate::config::EtlConfig;
use crate::error::Result;
use crate::io::SourceReader;
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::record::SourceFormat;
use crate::report::PipelineRunReport;
use crate::retry::{RetryController, RetryPolicy, Sleeper, ThreadSleeper};
use crate::runner::{ChunkFeed, build_strategy};
use crate::sink::{LoadSink, SqliteSink};
use crate::stage::ChunkProcessor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{error, info, info_span};

/// Runs the pipeline for one configuration against one sink.
pub struct Engine {
    config: EtlConfig,
    sink: Arc<dyn LoadSink>,
    sleeper: Arc<dyn Sleeper>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("sink", &self.sink.name())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EtlConfig, sink: Arc<dyn LoadSink>) -> Self {
        Self {
            config,
            sink,
            sleeper: Arc::new(ThreadSleeper),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the backoff sleeper (tests use a non-blocking one).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Setting the returned flag stops scheduling new chunks. Chunks already
    /// handed to a worker still finish.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<dyn LoadSink> {
        &self.sink
    }

    /// Process `path` end to end.
    ///
    /// # Errors
    /// [`crate::error::EtlError::Config`] for an invalid configuration or an
    /// undetectable source format.
    pub fn run(&self, path: impl AsRef<Path>) -> Result<PipelineRunReport> {
        self.run_instrumented(path).map(|(report, _)| report)
    }

    /// Like [`Engine::run`], also returning the run's metrics.
    ///
    /// # Errors
    /// See [`Engine::run`].
    pub fn run_instrumented(&self, path: impl AsRef<Path>) -> Result<(PipelineRunReport, MetricsSnapshot)> {
        let config = &self.config;
        config.validate()?;
        let path = path.as_ref();
        let format = match config.source_format {
            Some(format) => format,
            None => SourceFormat::detect(path)?,
        };

        let metrics = Arc::new(RunMetrics::new());
        let processor = ChunkProcessor::new(config, Arc::clone(&self.sink), Arc::clone(&metrics))?
            .with_sleeper(Arc::clone(&self.sleeper));
        let strategy = build_strategy(config.execution_strategy, processor, config.worker_count)?;

        let source = path.display().to_string();
        let span = info_span!("run", strategy = strategy.name(), source = %source);
        let _enter = span.enter();
        info!(
            format = %format,
            chunk_size = config.chunk_size,
            workers = config.worker_count,
            start_offset = config.start_offset,
            sink = self.sink.name(),
            "run started"
        );

        let started = Instant::now();
        let mut report = PipelineRunReport::new(strategy.name(), source);

        let reader = SourceReader::new(format);
        let controller = RetryController::new(RetryPolicy::from_config(config), self.sleeper.as_ref());
        let opened = controller.run("open", |_| reader.open_at(path, config.start_offset));
        report.retries += u64::from(opened.retries);

        match opened.result {
            Ok(stream) => {
                let chunks = Chunker::new(stream, format, config.chunk_size);
                let mut feed = ChunkFeed::new(chunks, Arc::clone(&self.cancel)).fail_fast(config.fail_fast);
                report.chunks = strategy.dispatch(&mut feed);
                let outcome = feed.into_outcome();
                report.cancelled = outcome.cancelled;
                report.aborted = outcome.aborted;
                report.fatal_error = outcome.fatal.map(|e| e.to_string());
            }
            Err(err) => {
                error!(error = %err, attempts = opened.attempts, "cannot open source");
                report.fatal_error = Some(err.to_string());
            }
        }

        report.finalize(config.start_offset, started.elapsed());
        metrics.sample_memory();
        report.peak_memory_mb = metrics.peak_memory_mb();
        info!(
            status = ?report.status,
            chunks = report.chunks.len(),
            valid = report.valid_records,
            invalid = report.invalid_records,
            rows_written = report.rows_written,
            retries = report.retries,
            elapsed_ms = report.duration.as_millis() as u64,
            "run finished"
        );
        Ok((report, metrics.snapshot()))
    }
}

/// Process `input_path` into the SQLite database at `config.database_path`.
///
/// # Errors
/// [`crate::error::EtlError::Config`] for an invalid configuration;
/// [`crate::error::EtlError::Storage`] if the database cannot be opened.
pub fn process(input_path: impl AsRef<Path>, config: &EtlConfig) -> Result<PipelineRunReport> {
    config.validate()?;
    let sink = SqliteSink::open(
        &config.database_path,
        config.connection_pool_size,
        config.pool_acquire_timeout(),
    )?;
    Engine::new(config.clone(), Arc::new(sink)).run(input_path)
}
