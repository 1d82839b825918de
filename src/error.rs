//! Error taxonomy for the ETL engine.
//!
//! Every failure the engine can observe maps onto one [`EtlError`] variant, and
//! every variant is classified as [`ErrorClass::Transient`] (worth retrying) or
//! [`ErrorClass::Permanent`] (fail fast). The [`retry`](crate::retry) controller
//! only ever looks at the class.
//!
//! Record-level variants (`Decode`, `Validation`) never escape their chunk; they
//! are counted into the chunk's report. Chunk-level variants (`Storage`,
//! `Timeout`, `QualityGateRejection`) end that chunk only. `Config` and `Io` on
//! source open are fatal for the run.

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, EtlError>;

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, lock contention, connection resets.
    Transient,
    /// Schema violations, malformed configuration, missing files.
    Permanent,
}

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    /// The source could not be opened or read.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// One input line could not be decoded (bad encoding, broken JSON, CSV framing).
    #[error("decode error at line {line} (offset {offset}): {reason}")]
    Decode {
        line: u64,
        offset: u64,
        reason: String,
    },

    /// A record failed a business rule.
    #[error("validation error at line {line}: {reason}")]
    Validation { line: u64, reason: String },

    /// The target store failed (connectivity, lock, schema).
    #[error("storage error: {message}")]
    Storage { message: String, retryable: bool },

    /// A chunk scored below the reject threshold.
    #[error("chunk {seq} rejected by quality gate (score {score:.4} <= {threshold:.4})")]
    QualityGateRejection { seq: u64, score: f64, threshold: f64 },

    /// Invalid configuration; raised before any processing begins.
    #[error("configuration error: {0}")]
    Config(String),

    /// A chunk exceeded its soft processing deadline.
    #[error("chunk {seq} exceeded its processing timeout of {timeout:?}")]
    Timeout { seq: u64, timeout: Duration },

    /// The run was cancelled before this work started.
    #[error("operation cancelled")]
    Cancelled,

    /// The retry controller gave up.
    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<EtlError>,
    },
}

impl EtlError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// A storage failure that may succeed on retry.
    pub fn storage_transient(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: true,
        }
    }

    /// A storage failure that will not succeed on retry.
    pub fn storage_permanent(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: false,
        }
    }

    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { source, .. } => classify_io(source.kind()),
            Self::Storage { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::RetriesExhausted { last, .. } => last.class(),
            Self::Decode { .. }
            | Self::Validation { .. }
            | Self::QualityGateRejection { .. }
            | Self::Config(_)
            | Self::Cancelled => ErrorClass::Permanent,
        }
    }

    /// Returns `true` if the retry controller should try again.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

fn classify_io(kind: io::ErrorKind) -> ErrorClass {
    use io::ErrorKind::*;
    match kind {
        Interrupted | TimedOut | WouldBlock | ConnectionReset | ConnectionAborted
        | UnexpectedEof => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

impl From<rusqlite::Error> for EtlError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode::*;
        let retryable = match &e {
            rusqlite::Error::SqliteFailure(err, _) => matches!(
                err.code,
                DatabaseBusy | DatabaseLocked | SystemIoFailure | CannotOpen | OutOfMemory
            ),
            _ => false,
        };
        Self::Storage {
            message: e.to_string(),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_permanent() {
        let err = EtlError::io("data.csv", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(err.to_string().contains("data.csv"));
    }

    #[test]
    fn connection_reset_is_transient() {
        let err = EtlError::io("db", io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_retryable());
    }

    #[test]
    fn sqlite_busy_is_retryable() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let err: EtlError = inner.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn sqlite_constraint_is_permanent() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("NOT NULL constraint failed".into()),
        );
        let err: EtlError = inner.into();
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn exhausted_keeps_class_of_last_error() {
        let err = EtlError::RetriesExhausted {
            operation: "upsert".into(),
            attempts: 3,
            last: Box::new(EtlError::storage_transient("locked")),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn config_and_timeout_classes() {
        assert_eq!(EtlError::Config("x".into()).class(), ErrorClass::Permanent);
        let t = EtlError::Timeout {
            seq: 1,
            timeout: Duration::from_millis(5),
        };
        assert_eq!(t.class(), ErrorClass::Transient);
    }
}
