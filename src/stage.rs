//! Per-chunk processing: validate, gate, load.
//!
//! [`ChunkProcessor::process_chunk`] walks one chunk through its lifecycle
//! and always returns a [`ChunkReport`]; nothing that happens to a single
//! chunk escapes as an error. Strategies differ only in how they schedule
//! calls to it and in which [`ValidationMode`] it was built with.

use crate::chunk::{Chunk, ChunkEntry};
use crate::config::EtlConfig;
use crate::error::{EtlError, Result};
use crate::gate::{GateDecision, QualityGate};
use crate::metrics::RunMetrics;
use crate::record::ParsedRecord;
use crate::report::{ChunkReport, ChunkState};
use crate::retry::{RetryController, RetryPolicy, Sleeper, ThreadSleeper};
use crate::sink::LoadSink;
use crate::validation::{ErrorCollector, RecordVerdict, ValidationRules, evaluate};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, error, warn};

/// Full error details kept per chunk; counts are always exact.
pub const DEFAULT_ERROR_SAMPLE_LIMIT: usize = 20;

/// Soft processing deadline for one chunk, checked cooperatively.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    seq: u64,
    limit: Option<(Instant, Duration)>,
}

impl Deadline {
    /// No deadline at all.
    pub fn none() -> Self {
        Self { seq: 0, limit: None }
    }

    /// Deadline `timeout` from now for chunk `seq`; unbounded for `None` or
    /// when `now + timeout` is not representable.
    pub fn after(seq: u64, timeout: Option<Duration>) -> Self {
        Self {
            seq,
            limit: timeout.and_then(|t| Instant::now().checked_add(t).map(|at| (at, t))),
        }
    }

    /// # Errors
    /// [`EtlError::Timeout`] once the deadline has passed.
    pub fn check(&self) -> Result<()> {
        match self.limit {
            Some((at, timeout)) if Instant::now() >= at => Err(EtlError::Timeout {
                seq: self.seq,
                timeout,
            }),
            _ => Ok(()),
        }
    }
}

/// How a chunk's records are validated. All modes produce the same verdicts
/// in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// One record at a time, in order.
    #[default]
    RowWise,
    /// Transpose to columns and apply each rule down a column.
    Columnar,
    /// Split into partitions validated in parallel, then merged in order.
    Partitioned { partitions: usize },
}

/// Validation result for a whole chunk.
#[derive(Debug, Clone, Default)]
pub struct Validated {
    /// Records that passed, in input order.
    pub valid: Vec<ParsedRecord>,
    /// Failed records, including undecodable lines.
    pub invalid: u64,
    /// Lines that could not be decoded.
    pub decode_errors: u64,
    /// Records dropped by a filter; not counted against the score.
    pub filtered: u64,
    /// Per-record failures, sampled.
    pub errors: ErrorCollector,
}

impl Validated {
    /// Empty result keeping at most `limit` detailed errors.
    pub fn with_sample_limit(limit: usize) -> Self {
        Self {
            errors: ErrorCollector::with_sample_limit(limit),
            ..Self::default()
        }
    }

    /// Fold one record's verdict in.
    pub fn push_verdict(&mut self, verdict: RecordVerdict) {
        match verdict {
            RecordVerdict::Valid(record) => self.valid.push(record),
            RecordVerdict::Invalid(err) => {
                self.invalid += 1;
                self.errors.add(err);
            }
            RecordVerdict::Filtered => self.filtered += 1,
        }
    }

    /// Count an undecodable line as a decode error.
    pub fn push_undecodable(&mut self, line: u64, offset: u64, reason: &str) {
        self.invalid += 1;
        self.decode_errors += 1;
        self.errors.add_decode(line, offset, reason);
    }

    /// Append `other`, which must cover the entries right after `self`'s.
    pub fn merge(&mut self, other: Validated) {
        self.valid.extend(other.valid);
        self.invalid += other.invalid;
        self.decode_errors += other.decode_errors;
        self.filtered += other.filtered;
        self.errors.merge(other.errors);
    }
}

/// Validate every entry of `chunk`.
///
/// # Errors
/// [`EtlError::Timeout`] when `deadline` passes mid-chunk.
pub fn validate_chunk(
    chunk: &Chunk,
    rules: &ValidationRules,
    mode: ValidationMode,
    sample_limit: usize,
    deadline: Deadline,
) -> Result<Validated> {
    match mode {
        ValidationMode::RowWise => validate_rows(chunk, &chunk.entries, rules, sample_limit, deadline),
        ValidationMode::Columnar => crate::columnar::validate_columns(chunk, rules, sample_limit, deadline),
        ValidationMode::Partitioned { partitions } => {
            let size = chunk.len().div_ceil(partitions.max(1)).max(1);
            let parts = chunk
                .entries
                .par_chunks(size)
                .map(|part| validate_rows(chunk, part, rules, sample_limit, deadline))
                .collect::<Result<Vec<_>>>()?;
            let mut merged = Validated::with_sample_limit(sample_limit);
            for part in parts {
                merged.merge(part);
            }
            Ok(merged)
        }
    }
}

fn validate_rows(
    chunk: &Chunk,
    entries: &[ChunkEntry],
    rules: &ValidationRules,
    sample_limit: usize,
    deadline: Deadline,
) -> Result<Validated> {
    let mut out = Validated::with_sample_limit(sample_limit);
    for entry in entries {
        deadline.check()?;
        match entry {
            ChunkEntry::Record(raw) => out.push_verdict(evaluate(raw, chunk.format, rules)),
            ChunkEntry::Undecodable {
                line,
                offset,
                reason,
            } => out.push_undecodable(*line, *offset, reason),
        }
    }
    Ok(out)
}

/// Everything a worker needs to take a chunk from `PENDING` to a terminal
/// state. Cheap to clone; clones share the sink and the metrics.
#[derive(Clone)]
pub struct ChunkProcessor {
    rules: Arc<ValidationRules>,
    gate: QualityGate,
    sink: Arc<dyn LoadSink>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    chunk_timeout: Option<Duration>,
    metrics: Arc<RunMetrics>,
    mode: ValidationMode,
    error_sample_limit: usize,
}

impl std::fmt::Debug for ChunkProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkProcessor")
            .field("sink", &self.sink.name())
            .field("gate", &self.gate)
            .field("retry", &self.retry)
            .field("chunk_timeout", &self.chunk_timeout)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ChunkProcessor {
    /// # Errors
    /// [`EtlError::Config`] for invalid gate thresholds.
    pub fn new(config: &EtlConfig, sink: Arc<dyn LoadSink>, metrics: Arc<RunMetrics>) -> Result<Self> {
        Ok(Self {
            rules: Arc::new(ValidationRules::from_config(config)),
            gate: QualityGate::from_config(config)?,
            sink,
            retry: RetryPolicy::from_config(config),
            sleeper: Arc::new(ThreadSleeper),
            chunk_timeout: config.chunk_timeout(),
            metrics,
            mode: ValidationMode::RowWise,
            error_sample_limit: DEFAULT_ERROR_SAMPLE_LIMIT,
        })
    }

    /// Replace the sleeper used between load retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Choose how records are validated.
    pub fn with_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Cap the detailed errors kept per chunk.
    pub fn with_error_sample_limit(mut self, limit: usize) -> Self {
        self.error_sample_limit = limit;
        self
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn metrics(&self) -> &Arc<RunMetrics> {
        &self.metrics
    }

    pub fn sink(&self) -> &Arc<dyn LoadSink> {
        &self.sink
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn sleeper(&self) -> &dyn Sleeper {
        self.sleeper.as_ref()
    }

    /// Validate, gate and load one chunk.
    pub fn process_chunk(&self, chunk: &Chunk) -> ChunkReport {
        let started = Instant::now();
        let span = debug_span!("chunk", seq = chunk.seq);
        let _enter = span.enter();

        let mut report = ChunkReport::pending(
            chunk.seq,
            chunk.first_offset().unwrap_or(0),
            chunk.resume_offset().unwrap_or(0),
            chunk.len() as u64,
        );
        let controller = RetryController::new(self.retry, self.sleeper.as_ref());

        report.state = ChunkState::Validating;
        let outcome = controller.run("validate", |_| {
            validate_chunk(
                chunk,
                &self.rules,
                self.mode,
                self.error_sample_limit,
                Deadline::after(chunk.seq, self.chunk_timeout),
            )
        });
        report.retries += outcome.retries;
        let validated = match outcome.result {
            Ok(v) => v,
            Err(err) => {
                warn!(chunk_seq = chunk.seq, error = %err, "chunk failed during validation");
                report.state = ChunkState::Failed;
                report.error = Some(err.to_string());
                return self.finish(report, started);
            }
        };

        report.valid = validated.valid.len() as u64;
        report.invalid = validated.invalid;
        report.decode_errors = validated.decode_errors;
        report.filtered = validated.filtered;
        let (reasons, errors) = validated.errors.into_parts();
        report.reasons = reasons;
        report.errors = errors;

        let scored = report.total.saturating_sub(report.filtered);
        let (score, decision) = self.gate.evaluate(report.valid as usize, scored as usize);
        report.score = score;
        report.decision = Some(decision);
        report.state = decision.into();
        debug!(
            chunk_seq = chunk.seq,
            valid = report.valid,
            invalid = report.invalid,
            score,
            decision = ?decision,
            "chunk validated"
        );

        if decision == GateDecision::Rejected {
            let err = EtlError::QualityGateRejection {
                seq: chunk.seq,
                score,
                threshold: self.gate.reject_threshold(),
            };
            warn!(chunk_seq = chunk.seq, score, "{err}");
            report.error = Some(err.to_string());
            return self.finish(report, started);
        }

        report.state = ChunkState::Loading;
        let records = validated.valid;
        let outcome = controller.run("upsert", |_| self.sink.upsert(&records));
        report.load_attempts = outcome.attempts;
        report.retries += outcome.retries;
        match outcome.result {
            Ok(load) => {
                report.load = load;
                report.state = ChunkState::Loaded;
                self.metrics
                    .record_load(load.rows_written, load.rows_skipped_duplicate);
            }
            Err(err) => {
                error!(
                    chunk_seq = chunk.seq,
                    attempts = outcome.attempts,
                    error = %err,
                    "chunk load failed"
                );
                report.state = ChunkState::LoadFailed;
                report.error = Some(err.to_string());
            }
        }
        self.finish(report, started)
    }

    fn finish(&self, mut report: ChunkReport, started: Instant) -> ChunkReport {
        report.duration = started.elapsed();
        self.metrics
            .record_chunk(report.total, report.valid, report.invalid, report.duration);
        self.metrics.record_retries(u64::from(report.retries));
        debug!(chunk_seq = report.seq, state = ?report.state, "chunk finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RawFields, RawRecord, SourceFormat};
    use crate::retry::NoopSleeper;
    use crate::sink::MemorySink;
    use serde_json::{Map, Value, json};

    fn log_entry(line: u64, status_code: i64) -> ChunkEntry {
        let Value::Object(map) = json!({
            "request_id": format!("r{line}"),
            "timestamp": "2024-05-01T10:00:00Z",
            "endpoint": "/api",
            "status_code": status_code,
            "response_time": 12.5,
        }) else {
            unreachable!()
        };
        ChunkEntry::Record(RawRecord {
            line,
            offset: line * 100,
            len: 100,
            fields: RawFields::Object(map),
        })
    }

    fn chunk(entries: Vec<ChunkEntry>) -> Chunk {
        Chunk::new(0, SourceFormat::Logs, entries)
    }

    fn processor(config: &EtlConfig) -> (ChunkProcessor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let p = ChunkProcessor::new(config, sink.clone(), Arc::new(RunMetrics::new()))
            .unwrap()
            .with_sleeper(Arc::new(NoopSleeper));
        (p, sink)
    }

    #[test]
    fn partitioned_and_row_wise_agree() {
        let mut entries: Vec<_> = (1..=9).map(|i| log_entry(i, 200)).collect();
        entries.push(log_entry(10, 42));
        entries.push(ChunkEntry::Undecodable {
            line: 11,
            offset: 1100,
            reason: "broken".into(),
        });
        let c = chunk(entries);
        let rules = ValidationRules::default();
        let rows = validate_chunk(&c, &rules, ValidationMode::RowWise, 5, Deadline::none()).unwrap();
        let parts = validate_chunk(
            &c,
            &rules,
            ValidationMode::Partitioned { partitions: 3 },
            5,
            Deadline::none(),
        )
        .unwrap();
        assert_eq!(rows.valid, parts.valid);
        assert_eq!(rows.invalid, 2);
        assert_eq!(parts.invalid, 2);
        assert_eq!(parts.decode_errors, 1);
        assert_eq!(rows.errors.sample(), parts.errors.sample());
    }

    #[test]
    fn expired_deadline_times_out() {
        let d = Deadline::after(4, Some(Duration::ZERO));
        assert!(matches!(d.check(), Err(EtlError::Timeout { seq: 4, .. })));
        assert!(Deadline::none().check().is_ok());
    }

    #[test]
    fn unrepresentable_deadline_is_unbounded() {
        let d = Deadline::after(1, Some(Duration::MAX));
        assert!(d.check().is_ok());
    }

    #[test]
    fn timeout_exhausts_retries_and_fails_chunk() {
        let config = EtlConfig {
            chunk_timeout_seconds: Some(0.0),
            max_retries: 2,
            ..EtlConfig::default()
        };
        let (p, sink) = processor(&config);
        let report = p.process_chunk(&chunk(vec![log_entry(1, 200)]));
        assert_eq!(report.state, ChunkState::Failed);
        assert_eq!(report.retries, 1);
        assert!(report.decision.is_none());
        assert_eq!(sink.row_count().unwrap(), 0);
    }

    #[test]
    fn rejected_chunk_loads_nothing() {
        let (p, sink) = processor(&EtlConfig::default());
        let report = p.process_chunk(&chunk(vec![log_entry(1, 200), log_entry(2, 9), log_entry(3, 9)]));
        assert_eq!(report.state, ChunkState::Rejected);
        assert_eq!(report.decision, Some(GateDecision::Rejected));
        assert!(report.error.is_some());
        assert_eq!(sink.row_count().unwrap(), 0);
    }

    #[test]
    fn filtered_records_do_not_lower_the_score() {
        let config = EtlConfig {
            min_status_code: Some(500),
            ..EtlConfig::default()
        };
        let (p, sink) = processor(&config);
        let report = p.process_chunk(&chunk(vec![log_entry(1, 503), log_entry(2, 200), log_entry(3, 200)]));
        assert_eq!(report.filtered, 2);
        assert_eq!(report.score, 1.0);
        assert_eq!(report.state, ChunkState::Loaded);
        assert_eq!(sink.row_count().unwrap(), 1);
    }

    #[test]
    fn empty_object_is_invalid_not_a_panic() {
        let (p, _) = processor(&EtlConfig::default());
        let entry = ChunkEntry::Record(RawRecord {
            line: 1,
            offset: 0,
            len: 3,
            fields: RawFields::Object(Map::new()),
        });
        let report = p.process_chunk(&chunk(vec![entry]));
        assert_eq!(report.invalid, 1);
        assert_eq!(report.state, ChunkState::Rejected);
    }
}
