//! Transparent decompression for source files.
//!
//! Sources arrive either plain or compressed (`events.jsonl.gz`,
//! `orders.csv.zst`, ...). The reader side never needs to know which: every
//! file is opened through [`auto_detect_reader`], which picks a codec and
//! returns a streaming decoder. Nothing is decompressed up front.
//!
//! ## Detection
//!
//! 1. The file name is matched against each registered codec's extensions.
//! 2. Failing that, the first bytes of the stream are compared with each
//!    codec's magic signature (so `orders.csv` that is secretly gzip still
//!    reads correctly).
//! 3. Otherwise the stream is passed through untouched.
//!
//! ## Built-in codecs
//!
//! | codec | extensions | feature |
//! |---|---|---|
//! | gzip | `.gz`, `.gzip` | `compression-gzip` |
//! | zstd | `.zst`, `.zstd` | `compression-zstd` |
//! | bzip2 | `.bz2`, `.bzip2` | `compression-bzip2` |
//! | xz | `.xz` | `compression-xz` |
//!
//! Further codecs can be plugged in with [`register_codec`].

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Default decoder buffer; bounds how much compressed input is held at once.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

static CODEC_REGISTRY: RwLock<Option<Vec<Arc<dyn CompressionCodec>>>> = RwLock::new(None);

fn builtin_codecs() -> Vec<Arc<dyn CompressionCodec>> {
    vec![
        #[cfg(feature = "compression-gzip")]
        Arc::new(GzipCodec),
        #[cfg(feature = "compression-zstd")]
        Arc::new(ZstdCodec),
        #[cfg(feature = "compression-bzip2")]
        Arc::new(Bzip2Codec),
        #[cfg(feature = "compression-xz")]
        Arc::new(XzCodec),
    ]
}

fn registry() -> Vec<Arc<dyn CompressionCodec>> {
    if let Some(codecs) = CODEC_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        return codecs.clone();
    }
    let mut lock = CODEC_REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(builtin_codecs).clone()
}

/// Add a codec to the process-wide registry. Later registrations are
/// consulted after the built-ins.
pub fn register_codec(codec: Arc<dyn CompressionCodec>) {
    let mut lock = CODEC_REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    lock.get_or_insert_with(builtin_codecs).push(codec);
}

/// Names of all registered codecs, built-ins first.
pub fn registered_codecs() -> Vec<String> {
    registry().iter().map(|c| c.name().to_string()).collect()
}

/// A streaming compression format.
///
/// Implementations are stored in a global registry and shared between worker
/// threads, hence `Send + Sync`.
pub trait CompressionCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Lower-case file suffixes including the dot, e.g. `&[".gz"]`.
    fn extensions(&self) -> &[&str];

    /// Leading signature of a stream in this format, if it has one.
    fn magic_bytes(&self) -> Option<&[u8]>;

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>>;

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> std::io::Result<Box<dyn Write>>;
}

/// Codec whose extension matches the end of `path`, case-insensitively.
pub fn codec_for_path(path: impl AsRef<Path>) -> Option<Arc<dyn CompressionCodec>> {
    let name = path.as_ref().to_string_lossy().to_ascii_lowercase();
    registry()
        .into_iter()
        .find(|codec| codec.extensions().iter().any(|ext| name.ends_with(ext)))
}

/// Strip a recognised compression suffix: `logs.jsonl.gz` → `logs.jsonl`.
pub fn strip_codec_extension(file_name: &str) -> &str {
    let lower = file_name.to_ascii_lowercase();
    for codec in registry() {
        for ext in codec.extensions() {
            if lower.ends_with(ext) {
                return &file_name[..file_name.len() - ext.len()];
            }
        }
    }
    file_name
}

fn codec_for_magic<R: BufRead>(reader: &mut R) -> Option<Arc<dyn CompressionCodec>> {
    let head = reader.fill_buf().ok()?;
    if head.is_empty() {
        return None;
    }
    registry()
        .into_iter()
        .find(|codec| codec.magic_bytes().is_some_and(|magic| head.starts_with(magic)))
}

/// Pick a codec for a buffered stream: extension first, then magic bytes.
///
/// The reader is only peeked, never advanced.
pub fn detect_codec<R: BufRead>(
    reader: &mut R,
    path_hint: impl AsRef<Path>,
) -> Option<Arc<dyn CompressionCodec>> {
    codec_for_path(&path_hint).or_else(|| codec_for_magic(reader))
}

/// Wrap `reader` in the decoder [`detect_codec`] picks, or pass it through.
pub fn auto_detect_reader<R: Read + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn Read>> {
    let mut buffered = BufReader::with_capacity(DEFAULT_BUFFER_CAPACITY, reader);
    match detect_codec(&mut buffered, &path_hint) {
        Some(codec) => codec
            .wrap_reader_dyn(Box::new(buffered))
            .with_context(|| format!("open {} decoder", codec.name())),
        None => Ok(Box::new(buffered)),
    }
}

/// Wrap `writer` in the encoder matching the extension of `path_hint`.
///
/// Encoders finish their stream when dropped.
pub fn auto_detect_writer<W: Write + 'static>(
    writer: W,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn Write>> {
    match codec_for_path(&path_hint) {
        Some(codec) => codec
            .wrap_writer_dyn(Box::new(writer))
            .with_context(|| format!("open {} encoder", codec.name())),
        None => Ok(Box::new(BufWriter::new(writer))),
    }
}

#[cfg(feature = "compression-gzip")]
struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".gzip"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x1f, 0x8b])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        // Log rotators concatenate gzip members; read all of them.
        Ok(Box::new(flate2::read::MultiGzDecoder::new(reader)))
    }

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> std::io::Result<Box<dyn Write>> {
        Ok(Box::new(flate2::write::GzEncoder::new(
            writer,
            flate2::Compression::default(),
        )))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extensions(&self) -> &[&str] {
        &[".zst", ".zstd"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x28, 0xb5, 0x2f, 0xfd])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as Box<dyn Read>)
    }

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> std::io::Result<Box<dyn Write>> {
        zstd::stream::write::Encoder::new(writer, 3)
            .map(|e| Box::new(e.auto_finish()) as Box<dyn Write>)
    }
}

#[cfg(feature = "compression-bzip2")]
struct Bzip2Codec;

#[cfg(feature = "compression-bzip2")]
impl CompressionCodec for Bzip2Codec {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn extensions(&self) -> &[&str] {
        &[".bz2", ".bzip2"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(b"BZh")
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        Ok(Box::new(bzip2::read::MultiBzDecoder::new(reader)))
    }

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> std::io::Result<Box<dyn Write>> {
        Ok(Box::new(bzip2::write::BzEncoder::new(
            writer,
            bzip2::Compression::default(),
        )))
    }
}

#[cfg(feature = "compression-xz")]
struct XzCodec;

#[cfg(feature = "compression-xz")]
impl CompressionCodec for XzCodec {
    fn name(&self) -> &str {
        "xz"
    }

    fn extensions(&self) -> &[&str] {
        &[".xz"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00])
    }

    fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
        Ok(Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)))
    }

    fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> std::io::Result<Box<dyn Write>> {
        Ok(Box::new(xz2::write::XzEncoder::new(writer, 6)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_extension_keeps_base_name() {
        #[cfg(feature = "compression-gzip")]
        assert_eq!(strip_codec_extension("events.JSONL.GZ"), "events.JSONL");
        assert_eq!(strip_codec_extension("orders.csv"), "orders.csv");
    }

    #[test]
    fn plain_stream_passes_through() {
        let mut r = auto_detect_reader(std::io::Cursor::new(b"a,b\n1,2\n".to_vec()), "x.csv").unwrap();
        let mut s = String::new();
        r.read_to_string(&mut s).unwrap();
        assert_eq!(s, "a,b\n1,2\n");
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn gzip_detected_by_magic_without_extension() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(b"hello\n").unwrap();
        let bytes = enc.finish().unwrap();

        let mut r = auto_detect_reader(std::io::Cursor::new(bytes), "mystery.log").unwrap();
        let mut s = String::new();
        r.read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello\n");
    }
}
