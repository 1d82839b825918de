//! Source Reader: a lazy, line-framed stream of [`RawRecord`]s.
//!
//! The file is decompressed on the fly through a fixed-size buffer and framed
//! one line at a time, so memory use is bounded by the buffer plus the longest
//! accepted line regardless of file size.
//!
//! Items are `Result<RawRecord, EtlError>`:
//! - [`EtlError::Decode`] marks a single bad line (invalid UTF-8, broken JSON,
//!   wrong CSV field count, over-long line). The stream carries on.
//! - [`EtlError::Io`] means the underlying stream failed. It is the last item.
//!
//! Offsets are byte positions in the decompressed stream. A stream can be
//! restarted with [`SourceReader::open_at`] from the end offset of any record;
//! compressed inputs are decompressed and discarded up to that point.

use crate::error::{EtlError, Result};
use crate::io::compression::{DEFAULT_BUFFER_CAPACITY, detect_codec};
use crate::record::{Header, RawFields, RawRecord, SourceFormat};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Longest line accepted by default; longer lines become decode errors.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Opens sources of one format.
#[derive(Debug, Clone)]
pub struct SourceReader {
    format: SourceFormat,
    buffer_capacity: usize,
    max_line_bytes: usize,
}

impl SourceReader {
    pub fn new(format: SourceFormat) -> Self {
        Self {
            format,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    /// Reader for the format implied by the file name.
    pub fn for_path(path: impl AsRef<Path>) -> Result<Self> {
        SourceFormat::detect(path).map(Self::new)
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    /// Open `path` from the beginning.
    ///
    /// # Errors
    /// [`EtlError::Io`] if the file is missing or unreadable, or the codec
    /// cannot be initialized.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<RecordStream> {
        self.open_at(path, 0)
    }

    /// Open `path` and resume at byte `offset` of the decompressed stream.
    ///
    /// An offset inside a line skips to the start of the next line. For
    /// delimited sources the header is always read from the start of the file.
    pub fn open_at(&self, path: impl AsRef<Path>, offset: u64) -> Result<RecordStream> {
        let path = path.as_ref();
        let label = path.display().to_string();
        let file = File::open(path).map_err(|e| EtlError::io(&label, e))?;
        let mut buffered = BufReader::with_capacity(self.buffer_capacity, file);
        let codec = detect_codec(&mut buffered, path);
        let decoded: Box<dyn Read> = match &codec {
            Some(codec) => codec
                .wrap_reader_dyn(Box::new(buffered))
                .map_err(|e| EtlError::io(&label, e))?,
            None => Box::new(buffered),
        };
        debug!(
            path = %label,
            format = %self.format,
            codec = codec.as_ref().map(|c| c.name()).unwrap_or("none"),
            offset,
            "opened source"
        );

        let mut stream = RecordStream {
            path: path.to_path_buf(),
            format: self.format,
            reader: BufReader::with_capacity(self.buffer_capacity, decoded),
            line_buf: Vec::with_capacity(1024),
            max_line_bytes: self.max_line_bytes,
            position: 0,
            line_no: 0,
            header: None,
            finished: false,
        };
        if self.format == SourceFormat::Transactions {
            stream.read_header()?;
        }
        if offset > stream.position {
            stream.skip_to(offset)?;
        }
        Ok(stream)
    }
}

/// What [`RecordStream::next_line`] framed.
struct Framed {
    consumed: u64,
    truncated: bool,
}

/// Lazy sequence of raw records from one source.
pub struct RecordStream {
    path: PathBuf,
    format: SourceFormat,
    reader: BufReader<Box<dyn Read>>,
    line_buf: Vec<u8>,
    max_line_bytes: usize,
    position: u64,
    line_no: u64,
    header: Option<Arc<Header>>,
    finished: bool,
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("position", &self.position)
            .field("line_no", &self.line_no)
            .finish_non_exhaustive()
    }
}

impl RecordStream {
    pub fn format(&self) -> SourceFormat {
        self.format
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decompressed byte offset just past the last framed line.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Header of a delimited source; `None` for JSON sources and empty files.
    pub fn header(&self) -> Option<&Header> {
        self.header.as_deref()
    }

    fn io_error(&self, e: io::Error) -> EtlError {
        EtlError::io(self.path.display().to_string(), e)
    }

    /// Frame the next line into `line_buf`, keeping at most `max_line_bytes`.
    /// Returns `None` at end of stream.
    fn next_line(&mut self) -> io::Result<Option<Framed>> {
        self.line_buf.clear();
        let mut consumed = 0u64;
        let mut truncated = false;
        loop {
            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                break;
            }
            let (take, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            let room = self.max_line_bytes.saturating_sub(self.line_buf.len());
            if take <= room {
                self.line_buf.extend_from_slice(&available[..take]);
            } else {
                self.line_buf.extend_from_slice(&available[..room]);
                truncated = true;
            }
            self.reader.consume(take);
            consumed += take as u64;
            if done {
                break;
            }
        }
        if consumed == 0 {
            return Ok(None);
        }
        self.position += consumed;
        self.line_no += 1;
        Ok(Some(Framed {
            consumed,
            truncated,
        }))
    }

    fn line_text(&self) -> &[u8] {
        let mut line = self.line_buf.as_slice();
        while let [rest @ .., b'\n' | b'\r'] = line {
            line = rest;
        }
        line
    }

    fn read_header(&mut self) -> Result<()> {
        while let Some(framed) = self.next_line().map_err(|e| self.io_error(e))? {
            let offset = self.position - framed.consumed;
            let text = self.line_text();
            if text.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let header = std::str::from_utf8(text)
                .ok()
                .filter(|_| !framed.truncated)
                .and_then(|t| parse_csv_line(t).ok())
                .ok_or_else(|| EtlError::Decode {
                    line: self.line_no,
                    offset,
                    reason: "unreadable header row".into(),
                })?;
            trace!(columns = ?header, "read header");
            self.header = Some(Arc::new(Header::new(header)));
            return Ok(());
        }
        Ok(())
    }

    /// Discard input until `offset`, then to the end of that line if the
    /// offset fell inside one.
    fn skip_to(&mut self, offset: u64) -> Result<()> {
        let mut at_line_start = true;
        while self.position < offset {
            let available = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e)),
            };
            if available.is_empty() {
                return Ok(());
            }
            let want = usize::try_from(offset - self.position).unwrap_or(usize::MAX);
            let take = want.min(available.len());
            self.line_no += available[..take].iter().filter(|&&b| b == b'\n').count() as u64;
            at_line_start = available[take - 1] == b'\n';
            self.reader.consume(take);
            self.position += take as u64;
        }
        if !at_line_start
            && let Some(framed) = self.next_line().map_err(|e| self.io_error(e))?
        {
            trace!(skipped = framed.consumed, "resynchronized to line start");
        }
        Ok(())
    }

    fn decode(&self, offset: u64, len: u64) -> Result<RawRecord> {
        let line = self.line_no;
        let decode_error = |reason: String| EtlError::Decode {
            line,
            offset,
            reason,
        };
        let text = std::str::from_utf8(self.line_text())
            .map_err(|e| decode_error(format!("invalid utf-8: {e}")))?;
        let fields = match self.format {
            SourceFormat::Logs => {
                let object: Map<String, Value> = serde_json::from_str(text)
                    .map_err(|e| decode_error(format!("malformed json: {e}")))?;
                RawFields::Object(object)
            }
            SourceFormat::Transactions => {
                let header = self
                    .header
                    .clone()
                    .ok_or_else(|| decode_error("row before header".into()))?;
                let values =
                    parse_csv_line(text).map_err(|e| decode_error(format!("malformed row: {e}")))?;
                if values.len() != header.len() {
                    return Err(decode_error(format!(
                        "expected {} fields, found {}",
                        header.len(),
                        values.len()
                    )));
                }
                RawFields::Row { header, values }
            }
        };
        Ok(RawRecord {
            line,
            offset,
            len,
            fields,
        })
    }
}

impl Iterator for RecordStream {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let framed = match self.next_line() {
                Ok(Some(framed)) => framed,
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(self.io_error(e)));
                }
            };
            let offset = self.position - framed.consumed;
            if framed.truncated {
                return Some(Err(EtlError::Decode {
                    line: self.line_no,
                    offset,
                    reason: format!("line exceeds {} bytes", self.max_line_bytes),
                }));
            }
            if self.line_text().iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(self.decode(offset, framed.consumed));
        }
    }
}

fn parse_csv_line(text: &str) -> std::result::Result<Vec<String>, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut record = csv::StringRecord::new();
    rdr.read_record(&mut record)?;
    Ok(record.iter().map(str::to_owned).collect())
}
