//! Testing utilities for ironload pipelines.
//!
//! - **Fixtures**: deterministic transaction and request-log datasets with a
//!   controlled share of corrupt rows, so tests know the exact counts to
//!   expect
//! - **Mock I/O**: temporary directories and writers that compress by file
//!   extension
//! - **Fault-injecting sinks**: [`FlakySink`] and [`FailingSink`] for retry
//!   and fail-fast behaviour
//!
//! # Quick Start
//!
//! ```no_run
//! use ironload::testing::*;
//! use ironload::{EtlConfig, Engine, MemorySink};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = TempDirPath::new()?;
//! let data = generate_transactions(1_000, 7, &Corruption { invalid_amount: 0.02, ..Corruption::default() });
//! let path = dir.file_path("tx.csv.gz");
//! write_transactions_csv(&path, &data.rows)?;
//!
//! let report = Engine::new(EtlConfig::default(), Arc::new(MemorySink::new())).run(&path)?;
//! assert_eq!(report.valid_records, data.expected_valid);
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod mock_io;
pub mod sinks;

pub use fixtures::*;
pub use mock_io::*;
pub use sinks::*;
