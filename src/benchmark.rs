//! Benchmark Harness.
//!
//! Runs the full pipeline once per strategy over the same dataset, each
//! against a fresh sink, and compares throughput, memory and correctness.
//! Correctness is a SHA-256 checksum over the natural keys the sink holds
//! after the run, so two strategies that loaded the same rows agree on it
//! regardless of chunk completion order.

use crate::config::{EtlConfig, ExecutionStrategyKind};
use crate::engine::Engine;
use crate::error::Result;
use crate::report::RunStatus;
use crate::retry::Sleeper;
use crate::sink::LoadSink;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// One strategy's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub strategy_name: String,
    pub records_per_second: f64,
    pub duration_seconds: f64,
    /// Peak memory growth during this strategy's run in MiB; `None` where
    /// not measurable.
    pub memory_mb: Option<f64>,
    pub status: RunStatus,
    pub valid_records: u64,
    pub rows_written: u64,
    /// Hex SHA-256 over the sorted natural keys in the sink.
    pub checksum: String,
    pub chunk_latency_p95_ms: f64,
}

/// All strategies' results for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparativeReport {
    pub dataset: String,
    pub chunk_size: usize,
    pub worker_count: usize,
    pub records: Vec<BenchmarkRecord>,
}

impl ComparativeReport {
    fn completed(&self) -> impl Iterator<Item = &BenchmarkRecord> {
        self.records.iter().filter(|r| r.status != RunStatus::Failed)
    }

    /// Every strategy that did not fail agrees on the valid-record count and
    /// the stored-key checksum.
    pub fn is_equivalent(&self) -> bool {
        let mut completed = self.completed();
        let Some(first) = completed.next() else {
            return true;
        };
        completed.all(|r| r.valid_records == first.valid_records && r.checksum == first.checksum)
    }

    pub fn fastest(&self) -> Option<&BenchmarkRecord> {
        self.completed()
            .max_by(|a, b| a.records_per_second.total_cmp(&b.records_per_second))
    }

    pub fn most_memory_efficient(&self) -> Option<&BenchmarkRecord> {
        self.completed()
            .filter_map(|r| r.memory_mb.map(|m| (m, r)))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, r)| r)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Benchmark: {}\n", self.dataset);
        let _ = writeln!(
            out,
            "chunk_size = {}, worker_count = {}\n",
            self.chunk_size, self.worker_count
        );
        out.push_str("| strategy | status | duration (s) | records/s | memory (MB) | valid | rows written | p95 chunk (ms) |\n");
        out.push_str("|---|---|---|---|---|---|---|---|\n");
        for r in &self.records {
            let memory = r
                .memory_mb
                .map_or_else(|| "n/a".to_string(), |m| format!("{m:.1}"));
            let _ = writeln!(
                out,
                "| {} | {:?} | {:.3} | {:.0} | {} | {} | {} | {:.2} |",
                r.strategy_name,
                r.status,
                r.duration_seconds,
                r.records_per_second,
                memory,
                r.valid_records,
                r.rows_written,
                r.chunk_latency_p95_ms,
            );
        }
        out.push('\n');
        if let Some(r) = self.fastest() {
            let _ = writeln!(out, "- fastest: {} ({:.0} records/s)", r.strategy_name, r.records_per_second);
        }
        if let Some(r) = self.most_memory_efficient() {
            let _ = writeln!(out, "- lowest memory: {}", r.strategy_name);
        }
        let _ = writeln!(
            out,
            "- results equivalent: {}",
            if self.is_equivalent() { "yes" } else { "NO" }
        );
        out
    }

    /// Write the report as pretty JSON.
    ///
    /// # Errors
    /// If serialization or the file write fails.
    pub fn write_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("serializing benchmark report")?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
    }
}

/// Builds a fresh, empty sink for each strategy run.
pub type SinkFactory = dyn Fn(ExecutionStrategyKind) -> Result<Arc<dyn LoadSink>>;

/// Runs several strategies over the same input.
pub struct BenchmarkHarness {
    config: EtlConfig,
    sink_factory: Box<SinkFactory>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl std::fmt::Debug for BenchmarkHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BenchmarkHarness")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BenchmarkHarness {
    pub fn new<F>(config: EtlConfig, sink_factory: F) -> Self
    where
        F: Fn(ExecutionStrategyKind) -> Result<Arc<dyn LoadSink>> + 'static,
    {
        Self {
            config,
            sink_factory: Box::new(sink_factory),
            sleeper: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Run each of `strategies` over `dataset`.
    ///
    /// # Errors
    /// Configuration errors, or a sink that cannot be created or queried.
    pub fn run(
        &self,
        strategies: &[ExecutionStrategyKind],
        dataset: impl AsRef<Path>,
    ) -> Result<ComparativeReport> {
        let dataset = dataset.as_ref();
        let mut records = Vec::with_capacity(strategies.len());
        for &kind in strategies {
            let config = EtlConfig {
                execution_strategy: kind,
                ..self.config.clone()
            };
            let sink = (self.sink_factory)(kind)?;
            let mut engine = Engine::new(config, Arc::clone(&sink));
            if let Some(sleeper) = &self.sleeper {
                engine = engine.with_sleeper(Arc::clone(sleeper));
            }
            let (report, metrics) = engine.run_instrumented(dataset)?;
            let record = BenchmarkRecord {
                strategy_name: kind.as_str().to_string(),
                records_per_second: report.records_per_second,
                duration_seconds: report.duration.as_secs_f64(),
                memory_mb: report.peak_memory_mb,
                status: report.status,
                valid_records: report.valid_records,
                rows_written: report.rows_written,
                checksum: sink.natural_key_digest()?,
                chunk_latency_p95_ms: metrics.chunk_latency_ms.p95,
            };
            info!(
                strategy = %record.strategy_name,
                status = ?record.status,
                records_per_second = record.records_per_second,
                "benchmark run complete"
            );
            records.push(record);
        }
        Ok(ComparativeReport {
            dataset: dataset.display().to_string(),
            chunk_size: self.config.chunk_size,
            worker_count: self.config.worker_count,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, rps: f64, mem: Option<f64>, status: RunStatus, checksum: &str) -> BenchmarkRecord {
        BenchmarkRecord {
            strategy_name: name.into(),
            records_per_second: rps,
            duration_seconds: 1.0,
            memory_mb: mem,
            status,
            valid_records: 10,
            rows_written: 10,
            checksum: checksum.into(),
            chunk_latency_p95_ms: 0.5,
        }
    }

    fn report(records: Vec<BenchmarkRecord>) -> ComparativeReport {
        ComparativeReport {
            dataset: "tx.csv".into(),
            chunk_size: 100,
            worker_count: 2,
            records,
        }
    }

    #[test]
    fn failed_runs_do_not_count() {
        let r = report(vec![
            record("sequential", 100.0, Some(30.0), RunStatus::Success, "abc"),
            record("thread-parallel", 900.0, Some(20.0), RunStatus::Failed, "zzz"),
            record("columnar-engine", 300.0, Some(25.0), RunStatus::Success, "abc"),
        ]);
        assert!(r.is_equivalent());
        assert_eq!(r.fastest().unwrap().strategy_name, "columnar-engine");
        assert_eq!(r.most_memory_efficient().unwrap().strategy_name, "columnar-engine");
    }

    #[test]
    fn checksum_mismatch_is_not_equivalent() {
        let r = report(vec![
            record("sequential", 1.0, None, RunStatus::Success, "abc"),
            record("process-parallel", 2.0, None, RunStatus::PartialSuccess, "abd"),
        ]);
        assert!(!r.is_equivalent());
        assert!(r.most_memory_efficient().is_none());
        assert!(r.to_markdown().contains("| process-parallel | PartialSuccess |"));
    }
}
