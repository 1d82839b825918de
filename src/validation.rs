//! Validate stage: business rules over cleaned records.
//!
//! Every rule is a small function in [`rules`] returning `Some(error)` on
//! failure. A record collects all of its failures, so one bad row reports
//! every problem at once; the first one is its [`ValidationOutcome::reason`].
//!
//! ```
//! use ironload::record::{Header, RawFields, RawRecord, SourceFormat};
//! use ironload::validation::{evaluate, ReasonCode, RecordVerdict, ValidationRules};
//! use std::sync::Arc;
//!
//! let header = Arc::new(Header::new(["order_id", "user_id", "amount", "status", "timestamp"]));
//! let raw = RawRecord {
//!     line: 2,
//!     offset: 41,
//!     len: 36,
//!     fields: RawFields::Row {
//!         header,
//!         values: ["1", "7", "-3.00", "completed", "2024-01-01 09:00:00"]
//!             .map(String::from)
//!             .to_vec(),
//!     },
//! };
//! match evaluate(&raw, SourceFormat::Transactions, &ValidationRules::default()) {
//!     RecordVerdict::Invalid(err) => assert_eq!(err.reason(), Some(ReasonCode::NonPositiveAmount)),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

use crate::config::EtlConfig;
use crate::record::{LogEntry, ParsedRecord, RawRecord, SourceFormat, Transaction};
use crate::transform::{self, CleanLog, CleanRecord, CleanTransaction, normalize_status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Machine-readable cause of a rejected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// The line itself could not be decoded.
    Decode,
    MissingField,
    NotNumeric,
    NonPositiveOrderId,
    NonPositiveUserId,
    NonPositiveAmount,
    UnknownStatus,
    InvalidTimestamp,
    StatusCodeOutOfRange,
    NegativeResponseTime,
    EmptyEndpoint,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::MissingField => "missing_field",
            Self::NotNumeric => "not_numeric",
            Self::NonPositiveOrderId => "non_positive_order_id",
            Self::NonPositiveUserId => "non_positive_user_id",
            Self::NonPositiveAmount => "non_positive_amount",
            Self::UnknownStatus => "unknown_status",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::StatusCodeOutOfRange => "status_code_out_of_range",
            Self::NegativeResponseTime => "negative_response_time",
            Self::EmptyEndpoint => "empty_endpoint",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rule failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: Option<String>,
    pub code: ReasonCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            field: None,
            code,
            message: message.into(),
        }
    }

    pub fn field(field: &str, code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "[{field}] {} ({})", self.message, self.code),
            None => write!(f, "{} ({})", self.message, self.code),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Per-record result of validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(Vec<ValidationError>),
}

impl ValidationOutcome {
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        if errors.is_empty() {
            Self::Valid
        } else {
            Self::Invalid(errors)
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Reason code of the first failure.
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            Self::Valid => None,
            Self::Invalid(errors) => errors.first().map(|e| e.code),
        }
    }

    pub fn errors(&self) -> &[ValidationError] {
        match self {
            Self::Valid => &[],
            Self::Invalid(errors) => errors,
        }
    }
}

/// Rule parameters taken from the run configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRules {
    /// Canonical status vocabulary (already normalized).
    pub allowed_statuses: Vec<String>,
    /// Log entries below this status code are filtered out, not rejected.
    pub min_status_code: Option<u16>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::from_config(&EtlConfig::default())
    }
}

impl ValidationRules {
    pub fn from_config(config: &EtlConfig) -> Self {
        let mut allowed: Vec<String> = config
            .allowed_statuses
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| normalize_status(s))
            .collect();
        allowed.sort();
        allowed.dedup();
        Self {
            allowed_statuses: allowed,
            min_status_code: config.min_status_code,
        }
    }

    pub fn is_allowed_status(&self, status: &str) -> bool {
        self.allowed_statuses.iter().any(|s| s == status)
    }
}

/// Types that can be checked against [`ValidationRules`].
pub trait Validate {
    fn validate(&self, rules: &ValidationRules) -> ValidationOutcome;
}

impl Validate for CleanTransaction {
    fn validate(&self, rules: &ValidationRules) -> ValidationOutcome {
        let errors = [
            rules::positive_id("order_id", &self.order_id, ReasonCode::NonPositiveOrderId),
            rules::positive_id("user_id", &self.user_id, ReasonCode::NonPositiveUserId),
            rules::positive_amount(&self.amount),
            rules::known_status(&self.status, rules),
            rules::valid_timestamp(&self.timestamp),
        ];
        ValidationOutcome::from_errors(errors.into_iter().flatten().collect())
    }
}

impl Validate for CleanLog {
    fn validate(&self, _rules: &ValidationRules) -> ValidationOutcome {
        let errors = [
            rules::valid_timestamp(&self.timestamp),
            rules::non_empty("endpoint", &self.endpoint, ReasonCode::EmptyEndpoint),
            rules::status_code_in_range(&self.status_code),
            rules::non_negative_response_time(&self.response_time_ms),
        ];
        ValidationOutcome::from_errors(errors.into_iter().flatten().collect())
    }
}

impl Validate for CleanRecord {
    fn validate(&self, rules: &ValidationRules) -> ValidationOutcome {
        match self {
            Self::Transaction(t) => t.validate(rules),
            Self::Log(l) => l.validate(rules),
        }
    }
}

/// Individual rules, shared by row-wise and column-wise validation.
pub mod rules {
    use super::{ReasonCode, ValidationError, ValidationRules};
    use crate::transform::Field;
    use chrono::NaiveDateTime;

    fn missing(field: &str) -> ValidationError {
        ValidationError::field(field, ReasonCode::MissingField, "required field is missing")
    }

    pub fn positive_id(field: &str, value: &Field<i64>, code: ReasonCode) -> Option<ValidationError> {
        match value {
            Field::Value(v) if *v > 0 => None,
            Field::Value(v) => Some(ValidationError::field(field, code, format!("must be > 0, got {v}"))),
            Field::Missing => Some(missing(field)),
            Field::Invalid(text) => Some(ValidationError::field(
                field,
                ReasonCode::NotNumeric,
                format!("not an integer: {text:?}"),
            )),
        }
    }

    pub fn positive_amount(value: &Field<f64>) -> Option<ValidationError> {
        match value {
            Field::Value(v) if *v > 0.0 => None,
            Field::Value(v) => Some(ValidationError::field(
                "amount",
                ReasonCode::NonPositiveAmount,
                format!("must be > 0, got {v}"),
            )),
            Field::Missing => Some(missing("amount")),
            Field::Invalid(text) => Some(ValidationError::field(
                "amount",
                ReasonCode::NotNumeric,
                format!("not a number: {text:?}"),
            )),
        }
    }

    pub fn known_status(value: &Field<String>, rules: &ValidationRules) -> Option<ValidationError> {
        match value {
            Field::Value(s) if rules.is_allowed_status(s) => None,
            Field::Value(s) | Field::Invalid(s) => Some(ValidationError::field(
                "status",
                ReasonCode::UnknownStatus,
                format!("{s:?} is not one of {:?}", rules.allowed_statuses),
            )),
            Field::Missing => Some(missing("status")),
        }
    }

    pub fn valid_timestamp(value: &Field<NaiveDateTime>) -> Option<ValidationError> {
        match value {
            Field::Value(_) => None,
            Field::Missing => Some(missing("timestamp")),
            Field::Invalid(text) => Some(ValidationError::field(
                "timestamp",
                ReasonCode::InvalidTimestamp,
                format!("unparseable date/time: {text:?}"),
            )),
        }
    }

    pub fn non_empty(field: &str, value: &Field<String>, code: ReasonCode) -> Option<ValidationError> {
        match value {
            Field::Value(s) if !s.trim().is_empty() => None,
            Field::Missing => Some(missing(field)),
            _ => Some(ValidationError::field(field, code, "must not be empty")),
        }
    }

    pub fn status_code_in_range(value: &Field<i64>) -> Option<ValidationError> {
        match value {
            Field::Value(v) if (100..=599).contains(v) => None,
            Field::Value(v) => Some(ValidationError::field(
                "status_code",
                ReasonCode::StatusCodeOutOfRange,
                format!("{v} is not an HTTP status code"),
            )),
            Field::Missing => Some(missing("status_code")),
            Field::Invalid(text) => Some(ValidationError::field(
                "status_code",
                ReasonCode::NotNumeric,
                format!("not an integer: {text:?}"),
            )),
        }
    }

    pub fn non_negative_response_time(value: &Field<f64>) -> Option<ValidationError> {
        match value {
            Field::Value(v) if *v >= 0.0 => None,
            Field::Value(v) => Some(ValidationError::field(
                "response_time",
                ReasonCode::NegativeResponseTime,
                format!("must be >= 0, got {v}"),
            )),
            Field::Missing => Some(missing("response_time")),
            Field::Invalid(text) => Some(ValidationError::field(
                "response_time",
                ReasonCode::NotNumeric,
                format!("not a number: {text:?}"),
            )),
        }
    }
}

/// A record that failed decoding or validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub line: u64,
    pub offset: u64,
    pub errors: Vec<ValidationError>,
}

impl RecordError {
    pub fn reason(&self) -> Option<ReasonCode> {
        self.errors.first().map(|e| e.code)
    }
}

/// Final verdict on one raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordVerdict {
    Valid(ParsedRecord),
    Invalid(RecordError),
    /// Valid, but excluded by a configured filter.
    Filtered,
}

/// Transform, validate and (if valid) build the typed record.
pub fn evaluate(raw: &RawRecord, format: SourceFormat, rules: &ValidationRules) -> RecordVerdict {
    let clean = transform::transform(raw, format);
    let outcome = clean.validate(rules);
    finish(clean, outcome, rules)
}

/// Turn a cleaned record and its outcome into a verdict.
pub fn finish(clean: CleanRecord, outcome: ValidationOutcome, rules: &ValidationRules) -> RecordVerdict {
    if let ValidationOutcome::Invalid(errors) = outcome {
        return RecordVerdict::Invalid(RecordError {
            line: clean.line(),
            offset: clean.offset(),
            errors,
        });
    }
    match build(clean) {
        Some(ParsedRecord::Log(entry))
            if rules
                .min_status_code
                .is_some_and(|min| entry.status_code < min) =>
        {
            RecordVerdict::Filtered
        }
        Some(parsed) => RecordVerdict::Valid(parsed),
        // Unreachable for outcomes produced by `validate`.
        None => RecordVerdict::Invalid(RecordError {
            line: 0,
            offset: 0,
            errors: vec![ValidationError::new(ReasonCode::MissingField, "incomplete record")],
        }),
    }
}

fn build(clean: CleanRecord) -> Option<ParsedRecord> {
    Some(match clean {
        CleanRecord::Transaction(t) => ParsedRecord::Transaction(Transaction {
            order_id: t.order_id.into_value()?,
            user_id: t.user_id.into_value()?,
            amount: t.amount.into_value()?,
            status: t.status.into_value()?,
            timestamp: t.timestamp.into_value()?,
            line: t.line,
            offset: t.offset,
        }),
        CleanRecord::Log(l) => {
            let timestamp = l.timestamp.into_value()?;
            let endpoint = l.endpoint.into_value()?;
            let log_key = l.request_id.unwrap_or_else(|| {
                format!("{}|{}|{}", timestamp.format("%Y-%m-%dT%H:%M:%S%.f"), endpoint, l.offset)
            });
            ParsedRecord::Log(LogEntry {
                log_key,
                timestamp,
                endpoint,
                status_code: u16::try_from(l.status_code.into_value()?).ok()?,
                response_time_ms: l.response_time_ms.into_value()?,
                user_agent: l.user_agent,
                line: l.line,
                offset: l.offset,
            })
        }
    })
}

/// Accumulates record errors for a chunk: exact counts per reason plus a
/// bounded sample of full error details.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    sample_limit: usize,
    sample: Vec<RecordError>,
    by_reason: BTreeMap<ReasonCode, u64>,
    total: u64,
}

impl ErrorCollector {
    pub fn with_sample_limit(sample_limit: usize) -> Self {
        Self {
            sample_limit,
            ..Self::default()
        }
    }

    pub fn add(&mut self, error: RecordError) {
        self.total += 1;
        if let Some(reason) = error.reason() {
            *self.by_reason.entry(reason).or_insert(0) += 1;
        }
        if self.sample.len() < self.sample_limit {
            self.sample.push(error);
        }
    }

    /// Record a line that could not be decoded.
    pub fn add_decode(&mut self, line: u64, offset: u64, message: impl Into<String>) {
        self.add(RecordError {
            line,
            offset,
            errors: vec![ValidationError::new(ReasonCode::Decode, message)],
        });
    }

    /// Fold another collector in; its sample fills whatever room is left.
    pub fn merge(&mut self, other: ErrorCollector) {
        self.total += other.total;
        for (reason, n) in other.by_reason {
            *self.by_reason.entry(reason).or_insert(0) += n;
        }
        let room = self.sample_limit.saturating_sub(self.sample.len());
        self.sample.extend(other.sample.into_iter().take(room));
    }

    pub fn error_count(&self) -> u64 {
        self.total
    }

    pub fn by_reason(&self) -> &BTreeMap<ReasonCode, u64> {
        &self.by_reason
    }

    pub fn sample(&self) -> &[RecordError] {
        &self.sample
    }

    pub fn into_parts(self) -> (BTreeMap<ReasonCode, u64>, Vec<RecordError>) {
        (self.by_reason, self.sample)
    }
}
