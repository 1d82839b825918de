use anyhow::Result;
use ironload::benchmark::ComparativeReport;
use ironload::retry::NoopSleeper;
use ironload::testing::{Corruption, TempDirPath, generate_logs, write_logs_jsonl};
use ironload::{BenchmarkHarness, EtlConfig, ExecutionStrategyKind, LoadSink, MemorySink, RunStatus, SqliteSink};
use std::sync::Arc;
use std::time::Duration;

fn config() -> EtlConfig {
    EtlConfig {
        chunk_size: 50,
        worker_count: 3,
        accept_threshold: 0.9,
        reject_threshold: 0.5,
        ..EtlConfig::default()
    }
}

#[test]
fn every_strategy_is_benchmarked_and_equivalent() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = dir.file_path("requests.jsonl");
    let data = generate_logs(
        300,
        17,
        &Corruption {
            invalid_status: 0.02,
            broken_line: 0.02,
            duplicate_key: 0.02,
            ..Corruption::default()
        },
    );
    write_logs_jsonl(&path, &data.lines)?;

    let harness = BenchmarkHarness::new(config(), |_| Ok(Arc::new(MemorySink::new()) as Arc<dyn LoadSink>))
        .with_sleeper(Arc::new(NoopSleeper));
    let report = harness.run(&ExecutionStrategyKind::ALL, &path)?;

    assert_eq!(report.records.len(), 5);
    assert_eq!(report.chunk_size, 50);
    assert!(report.is_equivalent());
    for record in &report.records {
        assert_ne!(record.status, RunStatus::Failed, "{}", record.strategy_name);
        assert_eq!(record.valid_records, data.expected_valid);
        assert_eq!(record.rows_written, data.expected_rows());
        assert_eq!(record.checksum.len(), 64);
        assert!(record.duration_seconds >= 0.0);
    }
    let names: Vec<_> = report.records.iter().map(|r| r.strategy_name.as_str()).collect();
    assert_eq!(
        names,
        ["sequential", "thread-parallel", "process-parallel", "columnar-engine", "distributed-engine"]
    );
    assert!(report.fastest().is_some());

    let markdown = report.to_markdown();
    assert!(markdown.contains("| strategy | status |"));
    assert!(markdown.contains("| distributed-engine |"));
    assert!(markdown.contains("results equivalent: yes"));
    Ok(())
}

#[test]
fn sqlite_sinks_per_strategy_agree() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = dir.file_path("requests.jsonl");
    write_logs_jsonl(&path, &generate_logs(120, 4, &Corruption::default()).lines)?;

    let db_dir = dir.path().to_path_buf();
    let harness = BenchmarkHarness::new(config(), move |kind| {
        let sink = SqliteSink::open(db_dir.join(format!("{kind}.db")), 3, Duration::from_secs(5))?;
        Ok(Arc::new(sink) as Arc<dyn LoadSink>)
    })
    .with_sleeper(Arc::new(NoopSleeper));
    let report = harness.run(
        &[ExecutionStrategyKind::Sequential, ExecutionStrategyKind::ProcessParallel],
        &path,
    )?;

    assert!(report.is_equivalent());
    assert_eq!(report.records[0].checksum, report.records[1].checksum);
    assert!(dir.file_path("process-parallel.db").exists());
    Ok(())
}

#[test]
fn report_json_round_trips() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = dir.file_path("requests.jsonl");
    write_logs_jsonl(&path, &generate_logs(40, 2, &Corruption::default()).lines)?;

    let harness = BenchmarkHarness::new(config(), |_| Ok(Arc::new(MemorySink::new()) as Arc<dyn LoadSink>))
        .with_sleeper(Arc::new(NoopSleeper));
    let report = harness.run(&[ExecutionStrategyKind::ColumnarEngine], &path)?;

    let out = dir.file_path("bench.json");
    report.write_json(&out)?;
    let back: ComparativeReport = serde_json::from_str(&std::fs::read_to_string(&out)?)?;
    assert_eq!(back.dataset, report.dataset);
    assert_eq!(back.records.len(), 1);
    assert_eq!(back.records[0].strategy_name, "columnar-engine");
    assert_eq!(back.records[0].checksum, report.records[0].checksum);
    assert_eq!(back.records[0].status, report.records[0].status);
    assert_eq!(back.records[0].valid_records, 40);
    Ok(())
}

#[test]
fn invalid_config_fails_the_benchmark() -> Result<()> {
    let harness = BenchmarkHarness::new(
        EtlConfig {
            worker_count: 0,
            ..config()
        },
        |_| Ok(Arc::new(MemorySink::new()) as Arc<dyn LoadSink>),
    );
    assert!(harness.run(&ExecutionStrategyKind::ALL, "requests.jsonl").is_err());
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn memory_is_charged_per_run_not_per_process() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = dir.file_path("requests.jsonl");
    write_logs_jsonl(&path, &generate_logs(50, 9, &Corruption::default()).lines)?;

    let ballast = std::hint::black_box(vec![7u8; 256 * 1024 * 1024]);
    let harness = BenchmarkHarness::new(config(), |_| Ok(Arc::new(MemorySink::new()) as Arc<dyn LoadSink>))
        .with_sleeper(Arc::new(NoopSleeper));
    let report = harness.run(
        &[ExecutionStrategyKind::Sequential, ExecutionStrategyKind::ThreadParallel],
        &path,
    )?;

    for record in &report.records {
        let mb = record.memory_mb.unwrap_or(f64::MAX);
        assert!(mb < 128.0, "{} charged {mb} MiB", record.strategy_name);
    }
    assert!(report.most_memory_efficient().is_some());
    drop(ballast);
    Ok(())
}
