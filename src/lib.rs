//! # ironload
//!
//! A **chunked ETL engine** for large transaction and request-log files.
//! ironload streams a plain or compressed input, validates it record by
//! record, scores each chunk through a quality gate, and loads the accepted
//! records idempotently into a relational store.
//!
//! ## Key Features
//!
//! - **Bounded-memory streaming** - gzip, zstd, bzip2 and xz are decoded on the fly, never materialized
//! - **Fault isolation** - a bad line or record is counted against its chunk and never stops the run
//! - **Quality gate** - each chunk is accepted, partially loaded, or rejected by score
//! - **Idempotent loads** - natural-key deduplication makes reloading a chunk harmless
//! - **Retry with backoff** - transient source and storage failures are retried; permanent ones fail fast
//! - **Pluggable strategies** - sequential, thread pool, isolated workers, columnar and partitioned engines
//! - **Benchmark harness** - run every strategy over the same input and check they agree
//!
//! ## Quick Start
//!
//! ```no_run
//! use ironload::{EtlConfig, ExecutionStrategyKind, process};
//!
//! # fn main() -> Result<(), ironload::EtlError> {
//! let config = EtlConfig {
//!     chunk_size: 5_000,
//!     execution_strategy: ExecutionStrategyKind::ThreadParallel,
//!     database_path: "warehouse/staging.db".into(),
//!     ..EtlConfig::default()
//! };
//! let report = process("data/transactions.csv.gz", &config)?;
//! println!("{:?}: {} rows written", report.status, report.rows_written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Data flow
//!
//! ```text
//! SourceReader -> Chunker -> ExecutionStrategy -> (per chunk) validate -> QualityGate -> LoadSink
//! ```
//!
//! [`retry::RetryController`] wraps the source open and every upsert. Chunk
//! reports may complete in any order under parallel strategies;
//! [`PipelineRunReport`] reassembles them by sequence number.
//!
//! ## Chunk lifecycle
//!
//! ```text
//! PENDING -> VALIDATING -> ACCEPTED | PARTIAL | REJECTED
//! ACCEPTED | PARTIAL -> LOADING -> LOADED | LOAD_FAILED
//! ```
//!
//! A chunk whose validation keeps timing out ends `FAILED`. `REJECTED`,
//! `LOAD_FAILED` and `FAILED` never block later chunks unless
//! [`EtlConfig::fail_fast`] is set.
//!
//! ## Run status
//!
//! - `SUCCESS` when every chunk was accepted and loaded
//! - `PARTIAL_SUCCESS` when at least one chunk loaded but not all cleanly
//! - `FAILED` when nothing loaded
//!
//! ## Logging
//!
//! Everything is instrumented with `tracing`. Install a subscriber with
//! [`logging::init_logging`] or bring your own.

pub mod benchmark;
pub mod chunk;
pub mod columnar;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod record;
pub mod report;
pub mod retry;
pub mod runner;
pub mod sink;
pub mod stage;
pub mod testing;
pub mod transform;
pub mod validation;

// Re-exports
pub use benchmark::{BenchmarkHarness, BenchmarkRecord, ComparativeReport};
pub use chunk::{Chunk, ChunkEntry, Chunker};
pub use config::{EtlConfig, ExecutionStrategyKind};
pub use engine::{Engine, process};
pub use error::{ErrorClass, EtlError, Result};
pub use gate::{GateDecision, QualityGate};
pub use io::{RecordStream, SourceReader};
pub use record::{LogEntry, NaturalKey, ParsedRecord, RawRecord, SourceFormat, Transaction};
pub use report::{ChunkReport, ChunkState, LoadResult, PipelineRunReport, RunStatus};
pub use retry::{RetryController, RetryPolicy, RetryState};
pub use runner::{ExecutionStrategy, build_strategy};
pub use sink::{LoadSink, MemorySink, SqliteSink};
pub use stage::ChunkProcessor;
pub use validation::{ReasonCode, ValidationOutcome};
