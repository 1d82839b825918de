//! Per-chunk and per-run reports.
//!
//! Reports are plain serde structs so an orchestrator can persist or ship
//! them as JSON. Chunk reports may be produced in any order by parallel
//! strategies; [`PipelineRunReport::finalize`] reassembles them by sequence
//! number and derives the run status.

use crate::gate::GateDecision;
use crate::validation::{ReasonCode, RecordError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Lifecycle of one chunk.
///
/// ```text
/// PENDING -> VALIDATING -> ACCEPTED | PARTIAL | REJECTED
/// ACCEPTED | PARTIAL -> LOADING -> LOADED | LOAD_FAILED
/// ```
/// `FAILED` covers chunks that never got a gate decision (timeout exhausted,
/// cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    Pending,
    Validating,
    Accepted,
    Partial,
    Rejected,
    Loading,
    Loaded,
    LoadFailed,
    Failed,
}

impl ChunkState {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Loaded | Self::LoadFailed | Self::Failed
        )
    }

    /// Ended without loading anything because of an error (not the gate).
    pub fn is_failure(self) -> bool {
        matches!(self, Self::LoadFailed | Self::Failed)
    }
}

impl From<GateDecision> for ChunkState {
    fn from(d: GateDecision) -> Self {
        match d {
            GateDecision::Accepted => Self::Accepted,
            GateDecision::Partial => Self::Partial,
            GateDecision::Rejected => Self::Rejected,
        }
    }
}

/// Outcome of one upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    /// Rows newly stored.
    pub rows_written: u64,
    /// Rows whose natural key was already present.
    pub rows_skipped_duplicate: u64,
}

impl LoadResult {
    /// Add another batch's counts.
    pub fn merge(&mut self, other: LoadResult) {
        self.rows_written += other.rows_written;
        self.rows_skipped_duplicate += other.rows_skipped_duplicate;
    }
}

/// Everything known about one processed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    /// Position of the chunk in input order, from 0.
    pub seq: u64,
    /// Offset of the first line in the chunk.
    pub first_offset: u64,
    /// Offset a restarted read would resume from after this chunk.
    pub resume_offset: u64,
    /// Records in the chunk, including decode errors.
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    /// Of `invalid`, how many lines could not be decoded at all.
    pub decode_errors: u64,
    /// Valid records excluded by a configured filter; not part of the score.
    pub filtered: u64,
    /// `valid / (total - filtered)`, in `[0, 1]`.
    pub score: f64,
    /// Gate decision, once one was made.
    pub decision: Option<GateDecision>,
    /// Where the chunk ended in its state machine.
    pub state: ChunkState,
    /// Failure counts per reason.
    pub reasons: BTreeMap<ReasonCode, u64>,
    /// First few failing records in full.
    pub errors: Vec<RecordError>,
    /// Result of the final load attempt.
    pub load: LoadResult,
    /// Load attempts made, including the first.
    pub load_attempts: u32,
    /// Processing attempts beyond the first (timeouts and load retries).
    pub retries: u32,
    /// Terminal error, if the chunk failed.
    pub error: Option<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl ChunkReport {
    /// Report for a chunk that has not been validated yet.
    pub fn pending(seq: u64, first_offset: u64, resume_offset: u64, total: u64) -> Self {
        Self {
            seq,
            first_offset,
            resume_offset,
            total,
            valid: 0,
            invalid: 0,
            decode_errors: 0,
            filtered: 0,
            score: 0.0,
            decision: None,
            state: ChunkState::Pending,
            reasons: BTreeMap::new(),
            errors: Vec::new(),
            load: LoadResult::default(),
            load_attempts: 0,
            retries: 0,
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// Rows made visible by this chunk.
    pub fn loaded_rows(&self) -> u64 {
        if self.state == ChunkState::Loaded {
            self.load.rows_written
        } else {
            0
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Every chunk was accepted and loaded.
    Success,
    /// At least one chunk loaded, but not all of them cleanly.
    PartialSuccess,
    /// Nothing loaded, or a fatal error occurred before any progress.
    Failed,
}

/// Aggregate over all chunks of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunReport {
    /// Name of the execution strategy.
    pub strategy: String,
    /// Input path as given.
    pub source: String,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Overall outcome, derived from the chunk states.
    pub status: RunStatus,
    /// Sorted by `seq`.
    pub chunks: Vec<ChunkReport>,
    pub total_records: u64,
    pub valid_records: u64,
    pub invalid_records: u64,
    pub decode_errors: u64,
    pub filtered_records: u64,
    pub rows_written: u64,
    pub rows_skipped_duplicate: u64,
    /// Retries across the source open and every chunk.
    pub retries: u64,
    /// Records read per second of wall-clock time.
    pub records_per_second: f64,
    /// Peak growth of the resident set size during the run in MiB, when
    /// measurable.
    pub peak_memory_mb: Option<f64>,
    /// Fatal error that ended the run early (configuration, source I/O).
    pub fatal_error: Option<String>,
    /// A cancel signal stopped scheduling.
    pub cancelled: bool,
    /// Fail-fast stopped the run after a terminal chunk failure.
    pub aborted: bool,
    /// Resume offset of the longest prefix of chunks that reached a terminal
    /// state; a safe `start_offset` for a rerun.
    pub last_committed_offset: u64,
}

impl PipelineRunReport {
    /// Empty report for a run that is about to start.
    pub fn new(strategy: impl Into<String>, source: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            strategy: strategy.into(),
            source: source.into(),
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
            status: RunStatus::Failed,
            chunks: Vec::new(),
            total_records: 0,
            valid_records: 0,
            invalid_records: 0,
            decode_errors: 0,
            filtered_records: 0,
            rows_written: 0,
            rows_skipped_duplicate: 0,
            retries: 0,
            records_per_second: 0.0,
            peak_memory_mb: None,
            fatal_error: None,
            cancelled: false,
            aborted: false,
            last_committed_offset: 0,
        }
    }

    /// Sort chunk reports, fold totals and derive [`RunStatus`].
    ///
    /// `start_offset` is where this run began reading; it is the committed
    /// offset when no chunk completed.
    pub fn finalize(&mut self, start_offset: u64, elapsed: Duration) {
        self.chunks.sort_by_key(|c| c.seq);
        self.finished_at = SystemTime::now();
        self.duration = elapsed;

        self.total_records = self.chunks.iter().map(|c| c.total).sum();
        self.valid_records = self.chunks.iter().map(|c| c.valid).sum();
        self.invalid_records = self.chunks.iter().map(|c| c.invalid).sum();
        self.decode_errors = self.chunks.iter().map(|c| c.decode_errors).sum();
        self.filtered_records = self.chunks.iter().map(|c| c.filtered).sum();
        self.rows_written = self.chunks.iter().map(ChunkReport::loaded_rows).sum();
        self.rows_skipped_duplicate = self
            .chunks
            .iter()
            .filter(|c| c.state == ChunkState::Loaded)
            .map(|c| c.load.rows_skipped_duplicate)
            .sum();
        self.retries += self.chunks.iter().map(|c| u64::from(c.retries)).sum::<u64>();

        let secs = elapsed.as_secs_f64();
        self.records_per_second = if secs > 0.0 {
            self.total_records as f64 / secs
        } else {
            0.0
        };

        self.last_committed_offset = self
            .chunks
            .iter()
            .take_while(|c| c.state.is_terminal())
            .last()
            .map_or(start_offset, |c| c.resume_offset);

        self.status = self.derive_status();
    }

    fn derive_status(&self) -> RunStatus {
        let any_loaded = self.chunks.iter().any(|c| c.state == ChunkState::Loaded);
        // Vacuously clean for an empty source.
        let all_clean = self
            .chunks
            .iter()
            .all(|c| c.state == ChunkState::Loaded && c.decision == Some(GateDecision::Accepted));
        let interrupted = self.fatal_error.is_some() || self.cancelled || self.aborted;
        if all_clean && !interrupted {
            RunStatus::Success
        } else if any_loaded {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Failed
        }
    }

    /// Chunk reports in a given state.
    pub fn chunks_in(&self, state: ChunkState) -> impl Iterator<Item = &ChunkReport> {
        self.chunks.iter().filter(move |c| c.state == state)
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Serialize a [`Duration`] as fractional seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
