//! Sinks that fail on purpose.

use crate::error::{EtlError, Result};
use crate::record::{NaturalKey, ParsedRecord};
use crate::report::LoadResult;
use crate::sink::{LoadSink, MemorySink};
use std::sync::atomic::{AtomicU32, Ordering};

/// Fails the first `failures` upserts with a retryable storage error, then
/// delegates to `inner`.
#[derive(Debug)]
pub struct FlakySink<S = MemorySink> {
    inner: S,
    failures: u32,
    calls: AtomicU32,
}

impl<S: LoadSink> FlakySink<S> {
    pub fn new(inner: S, failures: u32) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicU32::new(0),
        }
    }

    /// Upsert calls so far, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: LoadSink> LoadSink for FlakySink<S> {
    fn name(&self) -> &str {
        "flaky"
    }

    fn upsert(&self, records: &[ParsedRecord]) -> Result<LoadResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(EtlError::storage_transient(format!(
                "database is locked (injected failure {call}/{})",
                self.failures
            )));
        }
        self.inner.upsert(records)
    }

    fn row_count(&self) -> Result<u64> {
        self.inner.row_count()
    }

    fn contains_key(&self, key: &NaturalKey) -> Result<bool> {
        self.inner.contains_key(key)
    }

    fn natural_keys(&self) -> Result<Vec<NaturalKey>> {
        self.inner.natural_keys()
    }
}

/// Rejects every upsert. Permanent by default.
#[derive(Debug, Default)]
pub struct FailingSink {
    retryable: bool,
    calls: AtomicU32,
}

impl FailingSink {
    /// Fails every upsert with a retryable error.
    pub fn transient() -> Self {
        Self {
            retryable: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LoadSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn upsert(&self, _records: &[ParsedRecord]) -> Result<LoadResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(if self.retryable {
            EtlError::storage_transient("connection reset by peer")
        } else {
            EtlError::storage_permanent("no such table: transactions")
        })
    }

    fn row_count(&self) -> Result<u64> {
        Ok(0)
    }

    fn contains_key(&self, _key: &NaturalKey) -> Result<bool> {
        Ok(false)
    }

    fn natural_keys(&self) -> Result<Vec<NaturalKey>> {
        Ok(Vec::new())
    }
}
