#[cfg(any(
    feature = "compression-gzip",
    feature = "compression-zstd",
    feature = "compression-bzip2",
    feature = "compression-xz"
))]
mod compression_tests {
    use anyhow::Result;
    use ironload::io::compression::{CompressionCodec, register_codec, registered_codecs};
    use ironload::testing::{Corruption, TempDirPath, generate_logs, write_logs_jsonl};
    use ironload::{RawRecord, SourceFormat, SourceReader};
    use std::io::{Read, Write};
    use std::path::Path;
    use std::sync::Arc;

    fn lines(n: usize) -> Vec<String> {
        generate_logs(n, 11, &Corruption::default()).lines
    }

    fn read_back(path: &Path) -> Result<Vec<RawRecord>> {
        Ok(SourceReader::for_path(path)?
            .open(path)?
            .collect::<ironload::Result<_>>()?)
    }

    fn roundtrip(file_name: &str) -> Result<()> {
        let dir = TempDirPath::new()?;
        let path = dir.file_path(file_name);
        let data = lines(200);
        write_logs_jsonl(&path, &data)?;

        let records = read_back(&path)?;
        assert_eq!(records.len(), 200);
        assert_eq!(records[199].field("request_id").as_deref(), Some("req-200"));

        let plain: usize = data.iter().map(|l| l.len() + 1).sum();
        assert!(std::fs::metadata(&path)?.len() < plain as u64);
        Ok(())
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_gzip_roundtrip() -> Result<()> {
        roundtrip("requests.jsonl.gz")
    }

    #[cfg(feature = "compression-zstd")]
    #[test]
    fn test_zstd_roundtrip() -> Result<()> {
        roundtrip("requests.jsonl.zst")
    }

    #[cfg(feature = "compression-bzip2")]
    #[test]
    fn test_bzip2_roundtrip() -> Result<()> {
        roundtrip("requests.jsonl.bz2")
    }

    #[cfg(feature = "compression-xz")]
    #[test]
    fn test_xz_roundtrip() -> Result<()> {
        roundtrip("requests.jsonl.xz")
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_magic_byte_detection_without_extension() -> Result<()> {
        let dir = TempDirPath::new()?;
        let gz = dir.file_path("requests.jsonl.gz");
        write_logs_jsonl(&gz, &lines(10))?;
        let renamed = dir.file_path("requests.jsonl");
        std::fs::rename(&gz, &renamed)?;

        let records = read_back(&renamed)?;
        assert_eq!(records.len(), 10);
        Ok(())
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_resume_inside_compressed_stream() -> Result<()> {
        let dir = TempDirPath::new()?;
        let path = dir.file_path("requests.ndjson.gz");
        write_logs_jsonl(&path, &lines(50))?;

        let all = read_back(&path)?;
        let tail: Vec<RawRecord> = SourceReader::new(SourceFormat::Logs)
            .open_at(&path, all[30].offset)?
            .collect::<ironload::Result<_>>()?;
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0], all[30]);
        Ok(())
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_concatenated_gzip_members() -> Result<()> {
        let dir = TempDirPath::new()?;
        let first = dir.file_path("a.jsonl.gz");
        let second = dir.file_path("b.jsonl.gz");
        write_logs_jsonl(&first, &lines(5))?;
        write_logs_jsonl(&second, &lines(3))?;
        let mut joined = std::fs::read(&first)?;
        joined.extend(std::fs::read(&second)?);
        let rotated = dir.file_path("rotated.jsonl.gz");
        std::fs::write(&rotated, joined)?;

        assert_eq!(read_back(&rotated)?.len(), 8);
        Ok(())
    }

    #[test]
    fn test_custom_codec() -> Result<()> {
        struct NoOpCodec;

        impl CompressionCodec for NoOpCodec {
            fn name(&self) -> &str {
                "noop"
            }

            fn extensions(&self) -> &[&str] {
                &[".noop"]
            }

            fn magic_bytes(&self) -> Option<&[u8]> {
                None
            }

            fn wrap_reader_dyn(&self, reader: Box<dyn Read>) -> std::io::Result<Box<dyn Read>> {
                Ok(reader)
            }

            fn wrap_writer_dyn(&self, writer: Box<dyn Write>) -> std::io::Result<Box<dyn Write>> {
                Ok(writer)
            }
        }

        register_codec(Arc::new(NoOpCodec));
        assert!(registered_codecs().iter().any(|c| c == "noop"));

        let dir = TempDirPath::new()?;
        let path = dir.file_path("requests.jsonl.noop");
        write_logs_jsonl(&path, &lines(4))?;
        assert_eq!(SourceFormat::detect(&path)?, SourceFormat::Logs);
        assert_eq!(read_back(&path)?.len(), 4);
        Ok(())
    }
}

#[cfg(not(any(
    feature = "compression-gzip",
    feature = "compression-zstd",
    feature = "compression-bzip2",
    feature = "compression-xz"
)))]
#[test]
fn compression_tests_skipped() {
    println!("Compression tests skipped - no compression features enabled");
}
