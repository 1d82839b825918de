//! Deterministic datasets with controlled corruption.
//!
//! Each generated row is corrupted in at most one way, chosen by a seeded
//! [`SplitMix64`], so the expected valid/invalid/decode counts are exact.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Small, fast, seedable PRNG.
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in `[0, n)`; `n` must be non-zero.
    pub fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.below(items.len() as u64) as usize]
    }
}

/// Per-row corruption probabilities. Their sum should not exceed 1.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Corruption {
    /// Transactions: `amount <= 0`. Logs: negative response time.
    pub invalid_amount: f64,
    /// Transactions: status outside the vocabulary. Logs: status code 999.
    pub invalid_status: f64,
    pub invalid_timestamp: f64,
    /// Reuse an earlier natural key. The row itself is valid.
    pub duplicate_key: f64,
    /// Logs only: a line that is not valid JSON.
    pub broken_line: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    Amount,
    Status,
    Timestamp,
    Duplicate,
    Broken,
}

impl Corruption {
    fn roll(&self, rng: &mut SplitMix64, allow_broken: bool) -> Fault {
        let r = rng.next_f64();
        let mut edge = 0.0;
        let table = [
            (self.invalid_amount, Fault::Amount),
            (self.invalid_status, Fault::Status),
            (self.invalid_timestamp, Fault::Timestamp),
            (self.duplicate_key, Fault::Duplicate),
            (if allow_broken { self.broken_line } else { 0.0 }, Fault::Broken),
        ];
        for (rate, fault) in table {
            edge += rate;
            if r < edge {
                return fault;
            }
        }
        Fault::None
    }
}

/// One CSV row, kept as text so corrupt values survive verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub order_id: String,
    pub user_id: String,
    pub amount: String,
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTransactions {
    pub rows: Vec<TransactionRow>,
    pub expected_valid: u64,
    pub expected_invalid: u64,
    /// Valid rows whose order id repeats an earlier one.
    pub duplicate_keys: u64,
}

impl GeneratedTransactions {
    /// Distinct order ids among the valid rows.
    pub fn expected_rows(&self) -> u64 {
        self.expected_valid - self.duplicate_keys
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedLogs {
    /// One JSON document (or broken text) per line.
    pub lines: Vec<String>,
    pub expected_valid: u64,
    pub expected_invalid: u64,
    pub expected_decode_errors: u64,
    pub duplicate_keys: u64,
}

impl GeneratedLogs {
    pub fn expected_rows(&self) -> u64 {
        self.expected_valid - self.duplicate_keys
    }
}

const STATUSES: [&str; 6] = ["completed", "COMPLETED", "failed", "pending", "success", " Pending "];
const ENDPOINTS: [&str; 5] = ["/api/orders", "/api/users", "/api/cart", "/health", "/login"];
const STATUS_CODES: [u16; 9] = [200, 200, 200, 201, 204, 301, 404, 500, 503];
const USER_AGENTS: [&str; 3] = ["curl/8.5.0", "Mozilla/5.0", "okhttp/4.12"];

fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// `n` transaction rows with order ids `1..=n` (except duplicates).
pub fn generate_transactions(n: usize, seed: u64, corruption: &Corruption) -> GeneratedTransactions {
    let mut rng = SplitMix64::new(seed);
    let base = base_time();
    let mut out = GeneratedTransactions {
        rows: Vec::with_capacity(n),
        expected_valid: 0,
        expected_invalid: 0,
        duplicate_keys: 0,
    };
    for i in 1..=n as i64 {
        let fault = corruption.roll(&mut rng, false);
        let mut row = TransactionRow {
            order_id: i.to_string(),
            user_id: (1 + rng.below(5_000)).to_string(),
            amount: format!("{:.2}", 1.0 + rng.next_f64() * 499.0),
            status: (*rng.pick(&STATUSES)).to_string(),
            timestamp: (base + Duration::seconds(i * 37))
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        };
        match fault {
            Fault::Amount => {
                row.amount = if rng.below(2) == 0 { "0".into() } else { "-15.50".into() };
            }
            Fault::Status => row.status = "refunded??".into(),
            Fault::Timestamp => row.timestamp = "2024-13-45 25:61:00".into(),
            Fault::Duplicate if i > 1 => {
                row.order_id = (1 + rng.below(i as u64 - 1)).to_string();
            }
            _ => {}
        }
        let invalid = matches!(fault, Fault::Amount | Fault::Status | Fault::Timestamp);
        if invalid {
            out.expected_invalid += 1;
        } else {
            out.expected_valid += 1;
        }
        out.rows.push(row);
    }
    // A duplicate only counts if its target row was itself valid and stored.
    out.duplicate_keys = count_repeats(
        out.rows
            .iter()
            .filter(|r| is_valid_transaction(r))
            .map(|r| r.order_id.clone()),
    );
    out
}

fn is_valid_transaction(row: &TransactionRow) -> bool {
    row.status != "refunded??"
        && !row.timestamp.starts_with("2024-13")
        && row.amount.parse::<f64>().is_ok_and(|a| a > 0.0)
}

fn count_repeats(keys: impl Iterator<Item = String>) -> u64 {
    let mut seen = std::collections::HashSet::new();
    keys.filter(|k| !seen.insert(k.clone())).count() as u64
}

/// `n` request-log lines with request ids `req-1..=req-n` (except duplicates).
pub fn generate_logs(n: usize, seed: u64, corruption: &Corruption) -> GeneratedLogs {
    let mut rng = SplitMix64::new(seed);
    let base = base_time();
    let mut out = GeneratedLogs {
        lines: Vec::with_capacity(n),
        expected_valid: 0,
        expected_invalid: 0,
        expected_decode_errors: 0,
        duplicate_keys: 0,
    };
    let mut valid_keys = Vec::new();
    for i in 1..=n as i64 {
        let fault = corruption.roll(&mut rng, true);
        let mut request_id = format!("req-{i}");
        if fault == Fault::Duplicate && i > 1 {
            request_id = format!("req-{}", 1 + rng.below(i as u64 - 1));
        }
        let timestamp = match fault {
            Fault::Timestamp => "not-a-time".to_string(),
            _ => (base + Duration::seconds(i * 11))
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string(),
        };
        let status_code = match fault {
            Fault::Status => 999,
            _ => *rng.pick(&STATUS_CODES),
        };
        let response_time = match fault {
            Fault::Amount => -1.0,
            _ => (rng.next_f64() * 2_000.0 * 100.0).round() / 100.0,
        };
        let line = if fault == Fault::Broken {
            format!(r#"{{"request_id": "{request_id}", "timestamp": "{timestamp}", "endpoint": "#)
        } else {
            json!({
                "request_id": request_id,
                "timestamp": timestamp,
                "endpoint": rng.pick(&ENDPOINTS),
                "status_code": status_code,
                "response_time": response_time,
                "user_agent": rng.pick(&USER_AGENTS),
            })
            .to_string()
        };
        match fault {
            Fault::Broken => {
                out.expected_invalid += 1;
                out.expected_decode_errors += 1;
            }
            Fault::Amount | Fault::Status | Fault::Timestamp => out.expected_invalid += 1,
            Fault::None | Fault::Duplicate => {
                out.expected_valid += 1;
                valid_keys.push(request_id);
            }
        }
        out.lines.push(line);
    }
    out.duplicate_keys = count_repeats(valid_keys.into_iter());
    out
}
