//! Record types flowing through the engine.
//!
//! A [`RawRecord`] is one framed source line: its position in the
//! (decompressed) stream plus the structurally decoded fields. A
//! [`ParsedRecord`] is the typed, validated form ready to load. Every parsed
//! record keeps the line and byte offset of the raw record it came from.

use crate::error::{EtlError, Result};
use crate::io::compression::strip_codec_extension;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Shape of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Delimited text with an `order_id,user_id,amount,status,timestamp` header.
    Transactions,
    /// Line-delimited JSON request logs.
    Logs,
}

impl SourceFormat {
    /// Infer the format from a file name, ignoring any compression suffix.
    ///
    /// # Errors
    /// [`EtlError::Config`] when the extension is not recognized.
    pub fn detect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let base = strip_codec_extension(&name);
        if base.ends_with(".csv") {
            Ok(Self::Transactions)
        } else if base.ends_with(".jsonl")
            || base.ends_with(".ndjson")
            || base.ends_with(".json")
            || base.ends_with(".log")
        {
            Ok(Self::Logs)
        } else {
            Err(EtlError::Config(format!(
                "cannot infer source format from {}; set source_format",
                path.display()
            )))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column names of a delimited source, shared by every row of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
}

impl Header {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| {
                    let n: String = n.into();
                    n.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Structurally decoded content of one line.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFields {
    Row {
        header: Arc<Header>,
        values: Vec<String>,
    },
    Object(Map<String, Value>),
}

/// One source line and where it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based physical line number.
    pub line: u64,
    /// Byte offset of the first byte of the line in the decompressed stream.
    pub offset: u64,
    /// Length in bytes, including the line terminator.
    pub len: u64,
    pub fields: RawFields,
}

impl RawRecord {
    /// Offset just past this line; where a restarted read would resume.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.len
    }

    /// Text of a named field. `None` for absent columns, absent keys and JSON
    /// `null`. JSON numbers and booleans are rendered as text.
    pub fn field(&self, name: &str) -> Option<Cow<'_, str>> {
        match &self.fields {
            RawFields::Row { header, values } => header
                .position(name)
                .and_then(|i| values.get(i))
                .map(|v| Cow::Borrowed(v.as_str())),
            RawFields::Object(map) => match map.get(name)? {
                Value::Null => None,
                Value::String(s) => Some(Cow::Borrowed(s.as_str())),
                other => Some(Cow::Owned(other.to_string())),
            },
        }
    }
}

/// A validated transaction row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub order_id: i64,
    pub user_id: i64,
    pub amount: f64,
    pub status: String,
    pub timestamp: NaiveDateTime,
    pub line: u64,
    pub offset: u64,
}

/// A validated request-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Natural key: `request_id` when the source has one.
    pub log_key: String,
    pub timestamp: NaiveDateTime,
    pub endpoint: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub user_agent: String,
    pub line: u64,
    pub offset: u64,
}

impl LogEntry {
    /// Hour of day (0-23) the request was served in.
    pub fn hour(&self) -> u32 {
        self.timestamp.hour()
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }
}

/// Business-unique identity used for load-time deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NaturalKey {
    OrderId(i64),
    LogKey(String),
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrderId(id) => write!(f, "{id}"),
            Self::LogKey(key) => f.write_str(key),
        }
    }
}

/// A record that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedRecord {
    Transaction(Transaction),
    Log(LogEntry),
}

impl ParsedRecord {
    pub fn natural_key(&self) -> NaturalKey {
        match self {
            Self::Transaction(t) => NaturalKey::OrderId(t.order_id),
            Self::Log(l) => NaturalKey::LogKey(l.log_key.clone()),
        }
    }

    /// Byte offset of the source line.
    pub fn offset(&self) -> u64 {
        match self {
            Self::Transaction(t) => t.offset,
            Self::Log(l) => l.offset,
        }
    }

    pub fn line(&self) -> u64 {
        match self {
            Self::Transaction(t) => t.line,
            Self::Log(l) => l.line,
        }
    }
}
