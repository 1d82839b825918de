//! Scratch files for tests.
//!
//! Writers pick a compression codec from the file extension, so
//! `write_logs_jsonl("in.jsonl.gz", ..)` produces a gzip file.

use super::fixtures::TransactionRow;
use crate::io::compression::auto_detect_writer;
use anyhow::Context;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary directory that is deleted when dropped.
pub struct TempDirPath {
    #[allow(dead_code)]
    temp_dir: TempDir,
    path: PathBuf,
}

impl TempDirPath {
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().to_path_buf();
        Ok(Self { temp_dir, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `filename` inside this directory.
    #[must_use]
    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.path.join(filename)
    }
}

/// Write `rows` as a transaction CSV with header.
///
/// # Errors
/// If the file or the encoder cannot be written.
pub fn write_transactions_csv(path: impl AsRef<Path>, rows: &[TransactionRow]) -> anyhow::Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(auto_detect_writer(file, path)?);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write one line per item.
///
/// # Errors
/// If the file or the encoder cannot be written.
pub fn write_lines<S: AsRef<str>>(path: impl AsRef<Path>, lines: &[S]) -> anyhow::Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut out = auto_detect_writer(file, path)?;
    for line in lines {
        writeln!(out, "{}", line.as_ref())?;
    }
    out.flush()?;
    Ok(())
}

/// Write log lines as produced by [`super::generate_logs`].
///
/// # Errors
/// If the file or the encoder cannot be written.
pub fn write_logs_jsonl<S: AsRef<str>>(path: impl AsRef<Path>, lines: &[S]) -> anyhow::Result<()> {
    write_lines(path, lines)
}
