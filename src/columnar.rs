//! Column-oriented validation.
//!
//! A chunk is transposed into one vector per field, each coercion and rule
//! runs down a whole column, and the per-row results are stitched back
//! together. Failures are appended per row in the same rule order the
//! row-wise path uses, so both produce identical verdicts.

use crate::chunk::{Chunk, ChunkEntry};
use crate::error::Result;
use crate::record::{RawRecord, SourceFormat};
use crate::stage::{Deadline, Validated};
use crate::transform::{
    CleanLog, CleanRecord, CleanTransaction, Field, normalize_status, parse_decimal,
    parse_integer, parse_timestamp,
};
use crate::validation::{
    ReasonCode, RecordVerdict, ValidationError, ValidationOutcome, ValidationRules, finish, rules,
};
use chrono::NaiveDateTime;

/// Validate `chunk` column by column.
///
/// # Errors
/// [`crate::error::EtlError::Timeout`] when `deadline` passes while a column
/// is being built.
pub fn validate_columns(
    chunk: &Chunk,
    rules: &ValidationRules,
    sample_limit: usize,
    deadline: Deadline,
) -> Result<Validated> {
    let rows: Vec<&RawRecord> = chunk
        .entries
        .iter()
        .filter_map(|entry| match entry {
            ChunkEntry::Record(raw) => Some(raw),
            ChunkEntry::Undecodable { .. } => None,
        })
        .collect();

    let verdicts = match chunk.format {
        SourceFormat::Transactions => TransactionColumns::from_rows(&rows, deadline)?.verdicts(rules),
        SourceFormat::Logs => LogColumns::from_rows(&rows, deadline)?.verdicts(rules),
    };

    let mut verdicts = verdicts.into_iter();
    let mut out = Validated::with_sample_limit(sample_limit);
    for entry in &chunk.entries {
        match entry {
            ChunkEntry::Record(_) => {
                if let Some(verdict) = verdicts.next() {
                    out.push_verdict(verdict);
                }
            }
            ChunkEntry::Undecodable {
                line,
                offset,
                reason,
            } => out.push_undecodable(*line, *offset, reason),
        }
    }
    Ok(out)
}

/// Coerce one field across all rows. The first present name wins.
fn column<T>(
    rows: &[&RawRecord],
    names: &[&str],
    parse: impl Fn(&str) -> Option<T>,
    deadline: Deadline,
) -> Result<Vec<Field<T>>> {
    rows.iter()
        .map(|raw| {
            deadline.check()?;
            let text = names.iter().find_map(|name| raw.field(name));
            Ok(Field::parse_with(text.as_deref(), &parse))
        })
        .collect()
}

fn optional_text(rows: &[&RawRecord], name: &str) -> Vec<Option<String>> {
    rows.iter()
        .map(|raw| {
            raw.field(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .collect()
}

/// Run `rule` down `values`, appending failures to the matching row.
fn apply<T>(
    errors: &mut [Vec<ValidationError>],
    values: &[Field<T>],
    rule: impl Fn(&Field<T>) -> Option<ValidationError>,
) {
    for (row, value) in errors.iter_mut().zip(values) {
        row.extend(rule(value));
    }
}

fn verdicts(
    clean: Vec<CleanRecord>,
    errors: Vec<Vec<ValidationError>>,
    rules: &ValidationRules,
) -> Vec<RecordVerdict> {
    clean
        .into_iter()
        .zip(errors)
        .map(|(record, errs)| finish(record, ValidationOutcome::from_errors(errs), rules))
        .collect()
}

struct TransactionColumns {
    line: Vec<u64>,
    offset: Vec<u64>,
    order_id: Vec<Field<i64>>,
    user_id: Vec<Field<i64>>,
    amount: Vec<Field<f64>>,
    status: Vec<Field<String>>,
    timestamp: Vec<Field<NaiveDateTime>>,
}

impl TransactionColumns {
    fn from_rows(rows: &[&RawRecord], deadline: Deadline) -> Result<Self> {
        Ok(Self {
            line: rows.iter().map(|r| r.line).collect(),
            offset: rows.iter().map(|r| r.offset).collect(),
            order_id: column(rows, &["order_id"], parse_integer, deadline)?,
            user_id: column(rows, &["user_id"], parse_integer, deadline)?,
            amount: column(rows, &["amount"], parse_decimal, deadline)?,
            status: column(rows, &["status"], |s| Some(normalize_status(s)), deadline)?,
            timestamp: column(rows, &["timestamp"], parse_timestamp, deadline)?,
        })
    }

    fn verdicts(self, rule_set: &ValidationRules) -> Vec<RecordVerdict> {
        let mut errors = vec![Vec::new(); self.line.len()];
        apply(&mut errors, &self.order_id, |v| {
            rules::positive_id("order_id", v, ReasonCode::NonPositiveOrderId)
        });
        apply(&mut errors, &self.user_id, |v| {
            rules::positive_id("user_id", v, ReasonCode::NonPositiveUserId)
        });
        apply(&mut errors, &self.amount, rules::positive_amount);
        apply(&mut errors, &self.status, |v| rules::known_status(v, rule_set));
        apply(&mut errors, &self.timestamp, rules::valid_timestamp);
        verdicts(self.into_rows(), errors, rule_set)
    }

    fn into_rows(self) -> Vec<CleanRecord> {
        let Self {
            line,
            offset,
            order_id,
            user_id,
            amount,
            status,
            timestamp,
        } = self;
        let mut order_id = order_id.into_iter();
        let mut user_id = user_id.into_iter();
        let mut amount = amount.into_iter();
        let mut status = status.into_iter();
        let mut timestamp = timestamp.into_iter();
        line.into_iter()
            .zip(offset)
            .map_while(|(line, offset)| {
                Some(CleanRecord::Transaction(CleanTransaction {
                    line,
                    offset,
                    order_id: order_id.next()?,
                    user_id: user_id.next()?,
                    amount: amount.next()?,
                    status: status.next()?,
                    timestamp: timestamp.next()?,
                }))
            })
            .collect()
    }
}

struct LogColumns {
    line: Vec<u64>,
    offset: Vec<u64>,
    request_id: Vec<Option<String>>,
    timestamp: Vec<Field<NaiveDateTime>>,
    endpoint: Vec<Field<String>>,
    status_code: Vec<Field<i64>>,
    response_time_ms: Vec<Field<f64>>,
    user_agent: Vec<String>,
}

impl LogColumns {
    fn from_rows(rows: &[&RawRecord], deadline: Deadline) -> Result<Self> {
        Ok(Self {
            line: rows.iter().map(|r| r.line).collect(),
            offset: rows.iter().map(|r| r.offset).collect(),
            request_id: optional_text(rows, "request_id"),
            timestamp: column(rows, &["timestamp"], parse_timestamp, deadline)?,
            endpoint: column(rows, &["endpoint"], |s| Some(s.to_string()), deadline)?,
            status_code: column(rows, &["status_code"], parse_integer, deadline)?,
            response_time_ms: column(
                rows,
                &["response_time", "response_time_ms"],
                parse_decimal,
                deadline,
            )?,
            user_agent: optional_text(rows, "user_agent")
                .into_iter()
                .map(|ua| ua.unwrap_or_else(|| "unknown".to_string()))
                .collect(),
        })
    }

    fn verdicts(self, rule_set: &ValidationRules) -> Vec<RecordVerdict> {
        let mut errors = vec![Vec::new(); self.line.len()];
        apply(&mut errors, &self.timestamp, rules::valid_timestamp);
        apply(&mut errors, &self.endpoint, |v| {
            rules::non_empty("endpoint", v, ReasonCode::EmptyEndpoint)
        });
        apply(&mut errors, &self.status_code, rules::status_code_in_range);
        apply(&mut errors, &self.response_time_ms, rules::non_negative_response_time);
        verdicts(self.into_rows(), errors, rule_set)
    }

    fn into_rows(self) -> Vec<CleanRecord> {
        let Self {
            line,
            offset,
            request_id,
            timestamp,
            endpoint,
            status_code,
            response_time_ms,
            user_agent,
        } = self;
        let mut request_id = request_id.into_iter();
        let mut timestamp = timestamp.into_iter();
        let mut endpoint = endpoint.into_iter();
        let mut status_code = status_code.into_iter();
        let mut response_time_ms = response_time_ms.into_iter();
        let mut user_agent = user_agent.into_iter();
        line.into_iter()
            .zip(offset)
            .map_while(|(line, offset)| {
                Some(CleanRecord::Log(CleanLog {
                    line,
                    offset,
                    request_id: request_id.next()?,
                    timestamp: timestamp.next()?,
                    endpoint: endpoint.next()?,
                    status_code: status_code.next()?,
                    response_time_ms: response_time_ms.next()?,
                    user_agent: user_agent.next()?,
                }))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Header, RawFields};
    use crate::stage::{ValidationMode, validate_chunk};
    use std::sync::Arc;

    fn tx_chunk(rows: &[[&str; 5]]) -> Chunk {
        let header = Arc::new(Header::new(["order_id", "user_id", "amount", "status", "timestamp"]));
        let entries = rows
            .iter()
            .enumerate()
            .map(|(i, values)| {
                ChunkEntry::Record(RawRecord {
                    line: i as u64 + 2,
                    offset: i as u64 * 40,
                    len: 40,
                    fields: RawFields::Row {
                        header: Arc::clone(&header),
                        values: values.map(String::from).to_vec(),
                    },
                })
            })
            .collect();
        Chunk::new(3, SourceFormat::Transactions, entries)
    }

    #[test]
    fn columnar_matches_row_wise() {
        let chunk = tx_chunk(&[
            ["1", "10", "9.99", "completed", "2024-01-01 00:00:00"],
            ["2", "-1", "0", "weird", "nope"],
            ["3", "11", "1e2", "Success", "2024-01-02"],
            ["", "12", "abc", "pending", "2024-01-03T00:00:00Z"],
        ]);
        let rules = ValidationRules::default();
        let rows = validate_chunk(&chunk, &rules, ValidationMode::RowWise, 10, Deadline::none()).unwrap();
        let cols = validate_columns(&chunk, &rules, 10, Deadline::none()).unwrap();
        assert_eq!(rows.valid, cols.valid);
        assert_eq!(cols.valid.len(), 2);
        assert_eq!(rows.errors.sample(), cols.errors.sample());
        assert_eq!(cols.errors.sample()[0].errors.len(), 4);
        assert_eq!(cols.errors.sample()[0].reason(), Some(ReasonCode::NonPositiveUserId));
    }

    #[test]
    fn undecodable_lines_keep_their_position() {
        let mut chunk = tx_chunk(&[["1", "10", "9.99", "completed", "2024-01-01 00:00:00"]]);
        chunk.entries.insert(
            0,
            ChunkEntry::Undecodable {
                line: 1,
                offset: 0,
                reason: "bad quoting".into(),
            },
        );
        let cols = validate_columns(&chunk, &ValidationRules::default(), 10, Deadline::none()).unwrap();
        assert_eq!(cols.decode_errors, 1);
        assert_eq!(cols.valid.len(), 1);
        assert_eq!(cols.errors.sample()[0].line, 1);
    }
}
