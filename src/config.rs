//! Engine configuration.
//!
//! [`EtlConfig`] is a plain struct with public fields and a [`Default`]
//! implementation, so callers can use struct-update syntax:
//!
//! ```
//! use ironload::config::{EtlConfig, ExecutionStrategyKind};
//!
//! let config = EtlConfig {
//!     chunk_size: 500,
//!     execution_strategy: ExecutionStrategyKind::ThreadParallel,
//!     worker_count: 4,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! Validation is explicit ([`EtlConfig::validate`]) and always runs before the
//! engine touches the source or the store.

use crate::error::{EtlError, Result};
use crate::record::SourceFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Which execution substrate processes chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStrategyKind {
    /// One chunk at a time on the calling thread.
    #[default]
    Sequential,
    /// A dedicated rayon pool of `worker_count` threads.
    ThreadParallel,
    /// `worker_count` isolated workers fed through a bounded channel.
    ProcessParallel,
    /// Column-at-a-time validation of each chunk.
    ColumnarEngine,
    /// Each chunk partitioned across executors and merged.
    DistributedEngine,
}

impl ExecutionStrategyKind {
    /// Every strategy, in the order the benchmark harness reports them.
    pub const ALL: [ExecutionStrategyKind; 5] = [
        Self::Sequential,
        Self::ThreadParallel,
        Self::ProcessParallel,
        Self::ColumnarEngine,
        Self::DistributedEngine,
    ];

    /// Stable identifier used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::ThreadParallel => "thread-parallel",
            Self::ProcessParallel => "process-parallel",
            Self::ColumnarEngine => "columnar-engine",
            Self::DistributedEngine => "distributed-engine",
        }
    }
}

impl fmt::Display for ExecutionStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStrategyKind {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EtlError::Config(format!("unknown execution strategy: {s}")))
    }
}

/// Runtime options recognized by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EtlConfig {
    /// Maximum records (source lines) per chunk.
    pub chunk_size: usize,
    /// Total attempts allowed for a retried operation; `1` disables retries.
    pub max_retries: u32,
    /// First backoff delay, doubled on every further attempt.
    pub base_backoff_seconds: f64,
    /// Upper bound for a single backoff delay.
    pub max_backoff_seconds: f64,
    /// Add deterministic jitter to backoff delays.
    pub jitter: bool,
    /// Score at or above which a chunk is fully accepted.
    pub accept_threshold: f64,
    /// Score at or below which a chunk is rejected.
    pub reject_threshold: f64,
    pub execution_strategy: ExecutionStrategyKind,
    pub worker_count: usize,
    /// Soft per-chunk processing deadline.
    pub chunk_timeout_seconds: Option<f64>,
    /// Stop scheduling new chunks after the first terminal chunk failure.
    pub fail_fast: bool,
    pub connection_pool_size: usize,
    pub pool_acquire_timeout_seconds: f64,
    /// SQLite database used by [`crate::engine::process`].
    pub database_path: PathBuf,
    /// Input format; detected from the file name when `None`.
    pub source_format: Option<SourceFormat>,
    /// Decompressed byte offset to resume reading from.
    pub start_offset: u64,
    /// Accepted transaction statuses after normalization.
    pub allowed_statuses: Vec<String>,
    /// Keep only log records with `status_code >= min_status_code`.
    pub min_status_code: Option<u16>,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            max_retries: 3,
            base_backoff_seconds: 0.5,
            max_backoff_seconds: 30.0,
            jitter: true,
            accept_threshold: 0.95,
            reject_threshold: 0.5,
            execution_strategy: ExecutionStrategyKind::Sequential,
            worker_count: num_cpus::get().max(1),
            chunk_timeout_seconds: None,
            fail_fast: false,
            connection_pool_size: 4,
            pool_acquire_timeout_seconds: 10.0,
            database_path: PathBuf::from("ironload.db"),
            source_format: None,
            start_offset: 0,
            allowed_statuses: vec!["completed".into(), "failed".into(), "pending".into()],
            min_status_code: None,
        }
    }
}

impl EtlConfig {
    /// Load a configuration from a JSON file. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns [`EtlError::Config`] if the file cannot be read or parsed, or if
    /// the parsed configuration fails [`validate`](Self::validate).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EtlError::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| EtlError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option; returns the first problem found.
    ///
    /// # Errors
    /// Returns [`EtlError::Config`] describing the offending option.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EtlError::Config("chunk_size must be greater than 0".into()));
        }
        if self.max_retries == 0 {
            return Err(EtlError::Config(
                "max_retries must allow at least one attempt".into(),
            ));
        }
        check_seconds("base_backoff_seconds", self.base_backoff_seconds)?;
        check_seconds("max_backoff_seconds", self.max_backoff_seconds)?;
        check_seconds("pool_acquire_timeout_seconds", self.pool_acquire_timeout_seconds)?;
        if let Some(t) = self.chunk_timeout_seconds {
            check_seconds("chunk_timeout_seconds", t)?;
        }
        check_unit("accept_threshold", self.accept_threshold)?;
        check_unit("reject_threshold", self.reject_threshold)?;
        if self.accept_threshold < self.reject_threshold {
            return Err(EtlError::Config(format!(
                "accept_threshold ({}) must be >= reject_threshold ({})",
                self.accept_threshold, self.reject_threshold
            )));
        }
        if self.worker_count == 0 {
            return Err(EtlError::Config("worker_count must be greater than 0".into()));
        }
        if self.connection_pool_size == 0 {
            return Err(EtlError::Config(
                "connection_pool_size must be greater than 0".into(),
            ));
        }
        if self.allowed_statuses.iter().all(|s| s.trim().is_empty()) {
            return Err(EtlError::Config("allowed_statuses must not be empty".into()));
        }
        Ok(())
    }

    /// Delay before the first retry.
    pub fn base_backoff(&self) -> Duration {
        seconds(self.base_backoff_seconds)
    }

    /// Upper bound on any single retry delay.
    pub fn max_backoff(&self) -> Duration {
        seconds(self.max_backoff_seconds)
    }

    /// Soft per-chunk deadline; `None` means unbounded.
    pub fn chunk_timeout(&self) -> Option<Duration> {
        self.chunk_timeout_seconds.map(seconds)
    }

    /// How long a load waits for a pooled connection.
    pub fn pool_acquire_timeout(&self) -> Duration {
        seconds(self.pool_acquire_timeout_seconds)
    }
}

/// A seconds option must become a `Duration` that can still be added to
/// `Instant::now()`.
fn check_seconds(name: &str, v: f64) -> Result<()> {
    let fits = Duration::try_from_secs_f64(v)
        .ok()
        .and_then(|d| Instant::now().checked_add(d))
        .is_some();
    if fits {
        Ok(())
    } else {
        Err(EtlError::Config(format!(
            "{name} must be a finite, non-negative number of seconds within range (got {v})"
        )))
    }
}

fn seconds(v: f64) -> Duration {
    Duration::try_from_secs_f64(v.max(0.0)).unwrap_or(Duration::MAX)
}

fn check_unit(name: &str, v: f64) -> Result<()> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(EtlError::Config(format!("{name} must be within [0, 1] (got {v})")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = EtlConfig::default();
        assert_eq!(c.chunk_size, 10_000);
        assert_eq!(c.max_retries, 3);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let c = EtlConfig {
            accept_threshold: 0.4,
            reject_threshold: 0.6,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(EtlError::Config(_))));
    }

    #[test]
    fn equal_thresholds_allowed() {
        let c = EtlConfig {
            accept_threshold: 0.7,
            reject_threshold: 0.7,
            ..Default::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn nan_backoff_rejected() {
        let c = EtlConfig {
            base_backoff_seconds: f64::NAN,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn out_of_range_seconds_rejected() {
        for bad in [1e30, -1.0, f64::INFINITY] {
            let c = EtlConfig {
                chunk_timeout_seconds: Some(bad),
                ..Default::default()
            };
            assert!(matches!(c.validate(), Err(EtlError::Config(_))), "{bad}");
            let c = EtlConfig {
                pool_acquire_timeout_seconds: bad,
                ..Default::default()
            };
            assert!(matches!(c.validate(), Err(EtlError::Config(_))), "{bad}");
        }
        let far = EtlConfig {
            chunk_timeout_seconds: Some(1e15),
            ..Default::default()
        };
        assert!(far.validate().is_ok());
        assert_eq!(seconds(1e30), Duration::MAX);
    }

    #[test]
    fn strategy_names_round_trip_through_from_str() {
        for kind in ExecutionStrategyKind::ALL {
            assert_eq!(kind.as_str().parse::<ExecutionStrategyKind>().unwrap(), kind);
        }
        assert!("dask".parse::<ExecutionStrategyKind>().is_err());
    }

    #[test]
    fn json_uses_kebab_case_strategy() {
        let c: EtlConfig =
            serde_json::from_str(r#"{"execution_strategy": "columnar-engine", "chunk_size": 7}"#)
                .unwrap();
        assert_eq!(c.execution_strategy, ExecutionStrategyKind::ColumnarEngine);
        assert_eq!(c.chunk_size, 7);
        assert_eq!(c.max_retries, 3);
    }

    #[test]
    fn unknown_keys_rejected() {
        let r: std::result::Result<EtlConfig, _> = serde_json::from_str(r#"{"chunksize": 7}"#);
        assert!(r.is_err());
    }
}
