//! Source-side I/O: codec detection and line-framed record streams.

pub mod compression;
pub mod source;

pub use source::{MAX_LINE_BYTES, RecordStream, SourceReader};
