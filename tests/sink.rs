use anyhow::Result;
use chrono::NaiveDate;
use ironload::testing::TempDirPath;
use ironload::{LoadSink, LogEntry, MemorySink, NaturalKey, ParsedRecord, SqliteSink, Transaction};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;

fn request(key: &str, hour: u32, status_code: u16) -> ParsedRecord {
    ParsedRecord::Log(LogEntry {
        log_key: key.to_string(),
        timestamp: NaiveDate::from_ymd_opt(2024, 6, 3)
            .and_then(|d| d.and_hms_opt(hour, 5, 0))
            .unwrap_or_default(),
        endpoint: "/api/orders".to_string(),
        status_code,
        response_time_ms: 42.5,
        user_agent: "curl/8.5.0".to_string(),
        line: 1,
        offset: 0,
    })
}

fn order(id: i64) -> ParsedRecord {
    ParsedRecord::Transaction(Transaction {
        order_id: id,
        user_id: 7,
        amount: 12.0,
        status: "completed".to_string(),
        timestamp: NaiveDate::from_ymd_opt(2024, 6, 3)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .unwrap_or_default(),
        line: id as u64,
        offset: 0,
    })
}

#[test]
fn log_rows_carry_derived_columns() -> Result<()> {
    let dir = TempDirPath::new()?;
    let db = dir.file_path("logs.db");
    let sink = SqliteSink::open(&db, 1, Duration::from_secs(2))?;
    sink.upsert(&[request("a", 14, 503), request("b", 3, 200)])?;

    let conn = Connection::open(&db)?;
    let (hour, server_error, ts): (i64, bool, String) = conn.query_row(
        "SELECT hour, is_server_error, timestamp FROM request_logs WHERE log_key = 'a'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    assert_eq!(hour, 14);
    assert!(server_error);
    assert_eq!(ts, "2024-06-03 14:05:00");

    let server_error: bool = conn.query_row(
        "SELECT is_server_error FROM request_logs WHERE log_key = 'b'",
        [],
        |row| row.get(0),
    )?;
    assert!(!server_error);
    Ok(())
}

#[test]
fn mixed_batch_goes_to_both_tables() -> Result<()> {
    let dir = TempDirPath::new()?;
    let sink = SqliteSink::open(dir.file_path("mixed.db"), 2, Duration::from_secs(2))?;
    let loaded = sink.upsert(&[order(1), request("r1", 0, 200), order(1)])?;

    assert_eq!(loaded.rows_written, 2);
    assert_eq!(loaded.rows_skipped_duplicate, 1);
    assert_eq!(
        sink.natural_keys()?,
        vec![NaturalKey::OrderId(1), NaturalKey::LogKey("r1".to_string())]
    );
    Ok(())
}

#[test]
fn concurrent_upserts_stay_within_the_pool() -> Result<()> {
    let dir = TempDirPath::new()?;
    let sink = Arc::new(SqliteSink::open(dir.file_path("busy.db"), 3, Duration::from_secs(10))?);

    std::thread::scope(|scope| {
        for worker in 0..8_i64 {
            let sink = Arc::clone(&sink);
            scope.spawn(move || {
                let batch: Vec<_> = (0..50).map(|i| order(worker * 1_000 + i)).collect();
                sink.upsert(&batch).unwrap();
            });
        }
    });

    assert_eq!(sink.row_count()?, 400);
    assert!(sink.pool().peak_in_use() <= 3);
    assert_eq!(sink.pool().in_use(), 0);
    Ok(())
}

#[test]
fn sqlite_and_memory_sinks_agree() -> Result<()> {
    let dir = TempDirPath::new()?;
    let sqlite = SqliteSink::open(dir.file_path("a.db"), 1, Duration::from_secs(2))?;
    let memory = MemorySink::new();
    let batches = [
        vec![order(3), order(1), request("x", 1, 200)],
        vec![order(1), order(2), request("x", 1, 200)],
    ];
    for batch in &batches {
        let a = sqlite.upsert(batch)?;
        let b = memory.upsert(batch)?;
        assert_eq!(a, b);
    }
    assert_eq!(sqlite.row_count()?, memory.row_count()?);
    assert_eq!(sqlite.natural_key_digest()?, memory.natural_key_digest()?);
    Ok(())
}
