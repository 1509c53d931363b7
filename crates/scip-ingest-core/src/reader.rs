//! Materialization of compressed uploads into rewindable readers.
//!
//! The correlator reads every upload twice, so the compressed bytes have to
//! live somewhere seekable: in memory when the upload is small enough, or in
//! a temporary file otherwise. Either way the correlator sees the same
//! [`DecompressingReader`].
//!
//! # Decision policy
//!
//! 1. A declared uncompressed size above the in-memory ceiling spills
//!    straight to disk.
//! 2. Otherwise the compressed payload is read into memory. Without a
//!    declared uncompressed size, it is estimated at
//!    [`ESTIMATED_COMPRESSION_RATIO`] times the compressed size; if the
//!    estimate is above the ceiling the buffered bytes are spilled.
//! 3. Otherwise the reader is backed by the in-memory buffer.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use tempfile::{NamedTempFile, TempPath};

use crate::budget::ESTIMATED_COMPRESSION_RATIO;

/// Default ceiling for uncompressed bytes held in memory per upload.
pub const DEFAULT_MAX_IN_MEMORY_BYTES: i64 = 100 * 1024 * 1024;

/// Cap on the buffer allocated up front from a declared compressed size.
const MAX_INITIAL_CAPACITY: i64 = 16 * 1024 * 1024;

/// Configuration for [`prepare_reader`].
#[derive(Debug, Clone)]
pub struct BufferingConfig {
    /// Uploads whose (declared or estimated) uncompressed size exceeds this
    /// are spilled to disk.
    pub max_in_memory_bytes: i64,
    /// Directory for spill files. Defaults to the system temp directory.
    pub spill_dir: Option<PathBuf>,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            max_in_memory_bytes: DEFAULT_MAX_IN_MEMORY_BYTES,
            spill_dir: None,
        }
    }
}

/// Where the compressed bytes of an upload ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    InMemory,
    Spilled,
}

impl BufferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferKind::InMemory => "memory",
            BufferKind::Spilled => "disk",
        }
    }
}

trait CompressedSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> CompressedSource for T {}

/// Gzip decompressor over a seekable compressed source.
///
/// [`rewind`](DecompressingReader::rewind) seeks the source back to its
/// start and resets the decompression state, so the next read sequence
/// produces exactly the bytes the first one did.
pub struct DecompressingReader {
    decoder: Option<MultiGzDecoder<BufReader<Box<dyn CompressedSource>>>>,
    kind: BufferKind,
}

impl DecompressingReader {
    fn new(source: Box<dyn CompressedSource>, kind: BufferKind) -> Self {
        Self {
            decoder: Some(MultiGzDecoder::new(BufReader::new(source))),
            kind,
        }
    }

    pub fn in_memory(compressed: Vec<u8>) -> Self {
        Self::new(Box::new(Cursor::new(compressed)), BufferKind::InMemory)
    }

    fn spilled(file: File) -> Self {
        Self::new(Box::new(file), BufferKind::Spilled)
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Restarts decompression from the logical start of the upload.
    pub fn rewind(&mut self) -> io::Result<()> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "reader is poisoned"))?;
        let mut source = decoder.into_inner().into_inner();
        source.seek(SeekFrom::Start(0))?;
        self.decoder = Some(MultiGzDecoder::new(BufReader::new(source)));
        Ok(())
    }
}

impl Read for DecompressingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.read(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "reader is poisoned")),
        }
    }
}

/// A materialized upload plus whatever temporary storage backs it.
///
/// [`release`](PreparedUpload::release) must be called once processing is
/// over; it consumes the value, so it can run at most once. Dropping without
/// releasing still removes the spill file, but swallows removal errors.
pub struct PreparedUpload {
    pub reader: DecompressingReader,
    spill: Option<TempPath>,
}

impl PreparedUpload {
    pub fn kind(&self) -> BufferKind {
        self.reader.kind()
    }

    /// Closes the reader and removes any spill file.
    pub fn release(self) -> io::Result<()> {
        let PreparedUpload { reader, spill } = self;
        drop(reader);
        match spill {
            Some(path) => path.close(),
            None => Ok(()),
        }
    }
}

/// Materializes the compressed upload in `source` according to the
/// decision policy described in the module docs.
///
/// `compressed_size` is the declared on-wire size and only sizes the initial
/// allocation, capped at the in-memory ceiling and a fixed bound; declared
/// sizes are not trusted.
pub fn prepare_reader<R: Read>(
    mut source: R,
    compressed_size: i64,
    uncompressed_size: Option<i64>,
    config: &BufferingConfig,
) -> Result<PreparedUpload> {
    let ceiling = config.max_in_memory_bytes;

    if let Some(declared) = uncompressed_size {
        if declared > ceiling {
            tracing::debug!(declared, ceiling, "spilling upload to disk");
            return spill(config, |file| io::copy(&mut source, file).map(|_| ()));
        }
    }

    let hint = compressed_size.min(ceiling).clamp(0, MAX_INITIAL_CAPACITY);
    let capacity = usize::try_from(hint).unwrap_or(0);
    let mut compressed = Vec::with_capacity(capacity);
    source
        .read_to_end(&mut compressed)
        .context("Failed to read upload")?;

    if uncompressed_size.is_none() {
        let estimated = (compressed.len() as i64).saturating_mul(ESTIMATED_COMPRESSION_RATIO);
        if estimated > ceiling {
            tracing::debug!(estimated, ceiling, "spilling buffered upload to disk");
            return spill(config, |file| file.write_all(&compressed));
        }
    }

    Ok(PreparedUpload {
        reader: DecompressingReader::in_memory(compressed),
        spill: None,
    })
}

fn spill<F>(config: &BufferingConfig, write: F) -> Result<PreparedUpload>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let temp = match &config.spill_dir {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
    .context("Failed to create spill file")?;

    let (mut file, path) = temp.into_parts();
    let written = write(&mut file)
        .and_then(|_| file.flush())
        .and_then(|_| file.seek(SeekFrom::Start(0)).map(|_| ()));

    if let Err(err) = written {
        drop(file);
        if let Err(cleanup) = path.close() {
            tracing::warn!(error = %cleanup, "failed to remove partial spill file");
        }
        return Err(err).context("Failed to write spill file");
    }

    Ok(PreparedUpload {
        reader: DecompressingReader::spilled(file),
        spill: Some(path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn payload() -> Vec<u8> {
        (0..20_000u32).flat_map(|i| i.to_le_bytes()).collect()
    }

    fn config(ceiling: i64) -> BufferingConfig {
        BufferingConfig {
            max_in_memory_bytes: ceiling,
            spill_dir: None,
        }
    }

    fn read_all(reader: &mut DecompressingReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_declared_size_straddling_ceiling() {
        let compressed = gzip(&payload());
        let size = compressed.len() as i64;

        let below = prepare_reader(compressed.as_slice(), size, Some(1_000), &config(1_000))
            .unwrap();
        assert_eq!(below.kind(), BufferKind::InMemory);
        below.release().unwrap();

        let above = prepare_reader(compressed.as_slice(), size, Some(1_001), &config(1_000))
            .unwrap();
        assert_eq!(above.kind(), BufferKind::Spilled);
        above.release().unwrap();
    }

    #[test]
    fn test_estimated_size_straddling_ceiling() {
        let compressed = gzip(&payload());
        let estimate = compressed.len() as i64 * ESTIMATED_COMPRESSION_RATIO;

        let at = prepare_reader(compressed.as_slice(), 0, None, &config(estimate)).unwrap();
        assert_eq!(at.kind(), BufferKind::InMemory);
        at.release().unwrap();

        let over = prepare_reader(compressed.as_slice(), 0, None, &config(estimate - 1)).unwrap();
        assert_eq!(over.kind(), BufferKind::Spilled);
        over.release().unwrap();
    }

    #[test]
    fn test_absurd_declared_compressed_size_is_only_a_hint() {
        let data = payload();
        let compressed = gzip(&data);

        for ceiling in [DEFAULT_MAX_IN_MEMORY_BYTES, i64::MAX] {
            let mut prepared =
                prepare_reader(compressed.as_slice(), i64::MAX, Some(1), &config(ceiling))
                    .unwrap();
            assert_eq!(prepared.kind(), BufferKind::InMemory);
            assert_eq!(read_all(&mut prepared.reader), data);
            prepared.release().unwrap();
        }
    }

    #[test]
    fn test_rewind_reproduces_bytes_in_memory() {
        let data = payload();
        let compressed = gzip(&data);
        let mut prepared =
            prepare_reader(compressed.as_slice(), 0, Some(1), &config(i64::MAX)).unwrap();

        let first = read_all(&mut prepared.reader);
        prepared.reader.rewind().unwrap();
        let second = read_all(&mut prepared.reader);

        assert_eq!(first, data);
        assert_eq!(first, second);
        prepared.release().unwrap();
    }

    #[test]
    fn test_rewind_reproduces_bytes_after_partial_read_when_spilled() {
        let data = payload();
        let compressed = gzip(&data);
        let mut prepared = prepare_reader(compressed.as_slice(), 0, Some(i64::MAX), &config(0))
            .unwrap();
        assert_eq!(prepared.kind(), BufferKind::Spilled);

        let mut partial = vec![0u8; 1_000];
        prepared.reader.read_exact(&mut partial).unwrap();
        prepared.reader.rewind().unwrap();
        let full = read_all(&mut prepared.reader);
        prepared.reader.rewind().unwrap();
        let again = read_all(&mut prepared.reader);

        assert_eq!(&full[..1_000], partial.as_slice());
        assert_eq!(full, data);
        assert_eq!(full, again);
        prepared.release().unwrap();
    }

    #[test]
    fn test_release_removes_spill_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let compressed = gzip(b"hello");
        let prepared = prepare_reader(
            compressed.as_slice(),
            0,
            Some(10),
            &BufferingConfig {
                max_in_memory_bytes: 1,
                spill_dir: Some(dir.path().to_path_buf()),
            },
        )
        .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        prepared.release().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_spill_cleans_up() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "source went away"))
            }
        }

        let dir = tempfile::TempDir::new().unwrap();
        let result = prepare_reader(
            Failing,
            0,
            Some(10),
            &BufferingConfig {
                max_in_memory_bytes: 1,
                spill_dir: Some(dir.path().to_path_buf()),
            },
        );
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
