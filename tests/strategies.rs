//! Every execution strategy must produce the same result for the same input.

use anyhow::Result;
use ironload::retry::NoopSleeper;
use ironload::testing::{
    Corruption, TempDirPath, generate_logs, generate_transactions, write_logs_jsonl, write_transactions_csv,
};
use ironload::{
    ChunkReport, ChunkState, Engine, EtlConfig, ExecutionStrategyKind, GateDecision, LoadSink, MemorySink,
    PipelineRunReport, ReasonCode,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

fn corruption() -> Corruption {
    Corruption {
        invalid_amount: 0.03,
        invalid_status: 0.02,
        invalid_timestamp: 0.02,
        duplicate_key: 0.02,
        broken_line: 0.02,
    }
}

fn run(path: &Path, kind: ExecutionStrategyKind, workers: usize) -> Result<(PipelineRunReport, String)> {
    let sink = Arc::new(MemorySink::new());
    let config = EtlConfig {
        chunk_size: 37,
        execution_strategy: kind,
        worker_count: workers,
        accept_threshold: 0.95,
        reject_threshold: 0.5,
        ..EtlConfig::default()
    };
    let report = Engine::new(config, sink.clone())
        .with_sleeper(Arc::new(NoopSleeper))
        .run(path)?;
    Ok((report, sink.natural_key_digest()?))
}

type Outcome = (
    u64,
    u64,
    u64,
    u64,
    u64,
    u64,
    u64,
    Option<GateDecision>,
    ChunkState,
    BTreeMap<ReasonCode, u64>,
);

/// The parts of a chunk report that must not depend on the strategy.
fn outcome(c: &ChunkReport) -> Outcome {
    (
        c.seq,
        c.first_offset,
        c.resume_offset,
        c.total,
        c.valid,
        c.invalid,
        c.decode_errors,
        c.decision,
        c.state,
        c.reasons.clone(),
    )
}

fn assert_all_equivalent(path: &Path) -> Result<()> {
    let (baseline, digest) = run(path, ExecutionStrategyKind::Sequential, 1)?;
    assert!(baseline.chunks.len() > 1);
    for kind in ExecutionStrategyKind::ALL {
        for workers in [1, 4] {
            let (report, checksum) = run(path, kind, workers)?;
            assert_eq!(checksum, digest, "{kind} x{workers}");
            assert_eq!(report.strategy, kind.as_str());
            assert_eq!(report.status, baseline.status, "{kind} x{workers}");
            assert_eq!(report.valid_records, baseline.valid_records, "{kind} x{workers}");
            assert_eq!(report.invalid_records, baseline.invalid_records, "{kind} x{workers}");
            assert_eq!(report.rows_written, baseline.rows_written, "{kind} x{workers}");
            assert_eq!(report.last_committed_offset, baseline.last_committed_offset);
            let ours: Vec<_> = report.chunks.iter().map(outcome).collect();
            let theirs: Vec<_> = baseline.chunks.iter().map(outcome).collect();
            assert_eq!(ours, theirs, "{kind} x{workers}");
        }
    }
    Ok(())
}

#[test]
fn strategies_agree_on_transactions() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = dir.file_path("orders.csv");
    let data = generate_transactions(400, 21, &corruption());
    write_transactions_csv(&path, &data.rows)?;

    assert_all_equivalent(&path)?;

    let (report, _) = run(&path, ExecutionStrategyKind::ColumnarEngine, 4)?;
    assert_eq!(report.valid_records + report.invalid_records, 400);
    assert_eq!(report.valid_records, data.expected_valid);
    Ok(())
}

#[test]
fn strategies_agree_on_logs() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = dir.file_path("requests.jsonl");
    let data = generate_logs(400, 22, &corruption());
    write_logs_jsonl(&path, &data.lines)?;

    assert_all_equivalent(&path)?;

    let (report, _) = run(&path, ExecutionStrategyKind::DistributedEngine, 4)?;
    assert_eq!(report.valid_records, data.expected_valid);
    assert_eq!(report.decode_errors, data.expected_decode_errors);
    Ok(())
}

#[test]
fn clean_input_loads_every_distinct_key() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = dir.file_path("orders.csv");
    let data = generate_transactions(
        250,
        3,
        &Corruption {
            duplicate_key: 0.1,
            ..Corruption::default()
        },
    );
    write_transactions_csv(&path, &data.rows)?;

    for kind in ExecutionStrategyKind::ALL {
        let sink = Arc::new(MemorySink::new());
        let report = Engine::new(
            EtlConfig {
                chunk_size: 16,
                execution_strategy: kind,
                worker_count: 3,
                ..EtlConfig::default()
            },
            sink.clone(),
        )
        .with_sleeper(Arc::new(NoopSleeper))
        .run(&path)?;
        assert_eq!(sink.row_count()?, data.expected_rows(), "{kind}");
        assert_eq!(report.rows_written, data.expected_rows(), "{kind}");
        assert_eq!(report.rows_skipped_duplicate, data.duplicate_keys, "{kind}");
    }
    Ok(())
}
