//! Chunk Scheduler partitioning.
//!
//! [`Chunker`] pulls records from a source lazily and groups them into
//! [`Chunk`]s of at most `chunk_size` entries, numbered consecutively in input
//! order. Undecodable lines are kept in the chunk as
//! [`ChunkEntry::Undecodable`] so that they count toward its quality score.

use crate::error::{EtlError, Result};
use crate::record::{RawRecord, SourceFormat};

/// One position in a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEntry {
    Record(RawRecord),
    Undecodable { line: u64, offset: u64, reason: String },
}

impl ChunkEntry {
    pub fn offset(&self) -> u64 {
        match self {
            Self::Record(r) => r.offset,
            Self::Undecodable { offset, .. } => *offset,
        }
    }

    /// Offset a restarted read resumes from to skip this entry. For an
    /// undecodable line that is one byte in, which resynchronizes at the
    /// following line.
    pub fn resume_offset(&self) -> u64 {
        match self {
            Self::Record(r) => r.end_offset(),
            Self::Undecodable { offset, .. } => offset + 1,
        }
    }
}

/// An ordered, size-bounded batch of source entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Monotonic sequence number, starting at 0 for the first chunk of a read.
    pub seq: u64,
    pub format: SourceFormat,
    pub entries: Vec<ChunkEntry>,
}

impl Chunk {
    pub fn new(seq: u64, format: SourceFormat, entries: Vec<ChunkEntry>) -> Self {
        Self {
            seq,
            format,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.entries.first().map(ChunkEntry::offset)
    }

    pub fn resume_offset(&self) -> Option<u64> {
        self.entries.last().map(ChunkEntry::resume_offset)
    }
}

/// Lazily groups a record sequence into chunks.
///
/// A fatal item (anything but [`EtlError::Decode`]) closes the current chunk,
/// which is yielded first, and is then yielded itself as the last item.
pub struct Chunker<I> {
    source: I,
    format: SourceFormat,
    chunk_size: usize,
    next_seq: u64,
    pending_error: Option<EtlError>,
    done: bool,
}

impl<I> Chunker<I>
where
    I: Iterator<Item = Result<RawRecord>>,
{
    pub fn new(source: I, format: SourceFormat, chunk_size: usize) -> Self {
        Self {
            source,
            format,
            chunk_size: chunk_size.max(1),
            next_seq: 0,
            pending_error: None,
            done: false,
        }
    }
}

impl<I> Iterator for Chunker<I>
where
    I: Iterator<Item = Result<RawRecord>>,
{
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            self.done = true;
            return Some(Err(err));
        }
        if self.done {
            return None;
        }
        let mut entries = Vec::with_capacity(self.chunk_size.min(4096));
        while entries.len() < self.chunk_size {
            match self.source.next() {
                Some(Ok(record)) => entries.push(ChunkEntry::Record(record)),
                Some(Err(EtlError::Decode {
                    line,
                    offset,
                    reason,
                })) => entries.push(ChunkEntry::Undecodable {
                    line,
                    offset,
                    reason,
                }),
                Some(Err(fatal)) => {
                    self.pending_error = Some(fatal);
                    break;
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if entries.is_empty() {
            return self.pending_error.take().map(|err| {
                self.done = true;
                Err(err)
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(Ok(Chunk::new(seq, self.format, entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RawFields;

    fn raw(line: u64) -> Result<RawRecord> {
        Ok(RawRecord {
            line,
            offset: line * 10,
            len: 10,
            fields: RawFields::Object(Default::default()),
        })
    }

    #[test]
    fn last_chunk_may_be_smaller() {
        let chunks: Vec<Chunk> = Chunker::new((1..=7).map(raw), SourceFormat::Logs, 3)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.iter().map(Chunk::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(chunks.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(chunks[2].resume_offset(), Some(80));
    }

    #[test]
    fn decode_errors_stay_in_their_chunk() {
        let items = vec![
            raw(1),
            Err(EtlError::Decode {
                line: 2,
                offset: 20,
                reason: "bad".into(),
            }),
            raw(3),
        ];
        let chunks: Vec<_> = Chunker::new(items.into_iter(), SourceFormat::Logs, 10).collect();
        assert_eq!(chunks.len(), 1);
        let chunk = chunks[0].as_ref().unwrap();
        assert_eq!(chunk.len(), 3);
        assert!(matches!(chunk.entries[1], ChunkEntry::Undecodable { line: 2, .. }));
    }

    #[test]
    fn io_error_flushes_partial_chunk_then_ends() {
        let items = vec![
            raw(1),
            Err(EtlError::io(
                "f",
                std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt"),
            )),
            raw(3),
        ];
        let mut chunker = Chunker::new(items.into_iter(), SourceFormat::Logs, 10);
        assert_eq!(chunker.next().unwrap().unwrap().len(), 1);
        assert!(matches!(chunker.next(), Some(Err(EtlError::Io { .. }))));
        assert!(chunker.next().is_none());
    }
}
