//! Transform stage: coerce raw text into typed, cleaned fields.
//!
//! Transformation never fails. Each field ends up as [`Field::Value`],
//! [`Field::Missing`] or [`Field::Invalid`] (carrying the offending text);
//! deciding whether that is acceptable is the job of
//! [`validation`](crate::validation).

use crate::record::{RawRecord, SourceFormat};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Outcome of coercing one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Value(T),
    /// Absent, empty after trimming, or JSON `null`.
    Missing,
    /// Present but not coercible; holds the trimmed source text.
    Invalid(String),
}

impl<T> Field<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Trim `raw` and coerce it with `parse`.
    pub fn parse_with(raw: Option<&str>, parse: impl FnOnce(&str) -> Option<T>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::Missing,
            Some(text) => match parse(text) {
                Some(v) => Self::Value(v),
                None => Self::Invalid(text.to_string()),
            },
        }
    }
}

/// A transaction row after coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanTransaction {
    pub line: u64,
    pub offset: u64,
    pub order_id: Field<i64>,
    pub user_id: Field<i64>,
    pub amount: Field<f64>,
    /// Normalized to the canonical vocabulary where an alias is known,
    /// otherwise lower-cased as-is.
    pub status: Field<String>,
    pub timestamp: Field<NaiveDateTime>,
}

/// A request-log entry after coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanLog {
    pub line: u64,
    pub offset: u64,
    pub request_id: Option<String>,
    pub timestamp: Field<NaiveDateTime>,
    pub endpoint: Field<String>,
    pub status_code: Field<i64>,
    pub response_time_ms: Field<f64>,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CleanRecord {
    Transaction(CleanTransaction),
    Log(CleanLog),
}

impl CleanRecord {
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

/// Clean one raw record according to the source format.
pub fn transform(raw: &RawRecord, format: SourceFormat) -> CleanRecord {
    match format {
        SourceFormat::Transactions => CleanRecord::Transaction(transform_transaction(raw)),
        SourceFormat::Logs => CleanRecord::Log(transform_log(raw)),
    }
}

pub fn transform_transaction(raw: &RawRecord) -> CleanTransaction {
    CleanTransaction {
        line: raw.line,
        offset: raw.offset,
        order_id: Field::parse_with(raw.field("order_id").as_deref(), parse_integer),
        user_id: Field::parse_with(raw.field("user_id").as_deref(), parse_integer),
        amount: Field::parse_with(raw.field("amount").as_deref(), parse_decimal),
        status: Field::parse_with(raw.field("status").as_deref(), |s| {
            Some(normalize_status(s))
        }),
        timestamp: Field::parse_with(raw.field("timestamp").as_deref(), parse_timestamp),
    }
}

pub fn transform_log(raw: &RawRecord) -> CleanLog {
    let response_time = raw
        .field("response_time")
        .or_else(|| raw.field("response_time_ms"));
    CleanLog {
        line: raw.line,
        offset: raw.offset,
        request_id: raw
            .field("request_id")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        timestamp: Field::parse_with(raw.field("timestamp").as_deref(), parse_timestamp),
        endpoint: Field::parse_with(raw.field("endpoint").as_deref(), |s| Some(s.to_string())),
        status_code: Field::parse_with(raw.field("status_code").as_deref(), parse_integer),
        response_time_ms: Field::parse_with(response_time.as_deref(), parse_decimal),
        user_agent: raw
            .field("user_agent")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

/// Parse an integer, accepting integral decimals such as `"7.0"`.
pub fn parse_integer(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(v) = text.parse::<i64>() {
        return Some(v);
    }
    let f = parse_decimal(text)?;
    // `i64::MAX as f64` rounds up to 2^63, which is already out of range.
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}

/// Parse a finite decimal number (`"12"`, `"12.50"`, `"1e2"`).
pub fn parse_decimal(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Map a status to its canonical spelling: lower-case, with known aliases
/// folded onto `completed`, `failed` and `pending`.
pub fn normalize_status(text: &str) -> String {
    let lower = text.trim().to_lowercase().replace([' ', '-'], "_");
    match lower.as_str() {
        "complete" | "completed" | "success" | "successful" | "succeeded" | "done" => {
            "completed".to_string()
        }
        "fail" | "failed" | "failure" | "error" | "declined" => "failed".to_string(),
        "pending" | "processing" | "in_progress" | "queued" => "pending".to_string(),
        _ => lower,
    }
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parse a timestamp. Offsets are normalized to UTC; naive values are taken
/// as UTC already; a bare date means midnight.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn integers_accept_integral_decimals_only() {
        assert_eq!(parse_integer(" 42 "), Some(42));
        assert_eq!(parse_integer("7.0"), Some(7));
        assert_eq!(parse_integer("7.5"), None);
        assert_eq!(parse_integer("abc"), None);
    }

    #[test]
    fn integers_out_of_i64_range_are_rejected() {
        assert_eq!(parse_integer("9223372036854775807"), Some(i64::MAX));
        assert_eq!(parse_integer("9223372036854775808"), None);
        assert_eq!(parse_integer("9.223372036854775808e18"), None);
        assert_eq!(parse_integer("-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_integer("-1e19"), None);
    }

    #[test]
    fn decimals_reject_non_finite() {
        assert_eq!(parse_decimal("1e2"), Some(100.0));
        assert_eq!(parse_decimal("NaN"), None);
        assert_eq!(parse_decimal("inf"), None);
    }

    #[test]
    fn status_aliases_fold() {
        assert_eq!(normalize_status(" SUCCESS "), "completed");
        assert_eq!(normalize_status("In Progress"), "pending");
        assert_eq!(normalize_status("Declined"), "failed");
        assert_eq!(normalize_status("refunded"), "refunded");
    }

    #[test]
    fn timestamps_in_several_shapes() {
        let a = parse_timestamp("2024-03-01 10:20:30").unwrap();
        let b = parse_timestamp("2024-03-01T10:20:30").unwrap();
        let c = parse_timestamp("2024-03-01T12:20:30+02:00").unwrap();
        let d = parse_timestamp("2024-03-01T10:20:30.250Z").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(d.hour(), 10);
        assert_eq!(parse_timestamp("2024-03-01").unwrap().hour(), 0);
        assert!(parse_timestamp("2024-02-30 00:00:00").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn empty_text_is_missing_not_invalid() {
        assert_eq!(Field::parse_with(Some("   "), parse_integer), Field::Missing);
        assert_eq!(
            Field::parse_with(Some("x"), parse_integer),
            Field::Invalid("x".into())
        );
    }
}
