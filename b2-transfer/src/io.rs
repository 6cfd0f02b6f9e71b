//! Sources and sinks for ranged transfers.
//!
//! Large transfers read and write disjoint byte ranges concurrently, so the
//! traits here expose positioned access rather than a single cursor: every
//! part gets an independent view of the source, which also makes retries
//! rewindable by construction.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use sha1::{Digest as _, Sha1};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

/// Chunk size used when digesting a source sequentially.
const DIGEST_CHUNK: u64 = 1024 * 1024;

/// A SHA-1 digest together with the number of bytes it covers.
#[derive(Debug, Clone)]
pub struct ContentDigest {
    sha1: [u8; 20],
    length: u64,
}

impl ContentDigest {
    pub(crate) fn new(sha1: [u8; 20], length: u64) -> Self {
        Self { sha1, length }
    }

    /// The digest as a lowercase hex string, the wire format B2 uses.
    pub fn hex(&self) -> String {
        hex::encode(self.sha1)
    }

    /// The number of bytes digested.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Whether a hex digest names the same content.
    pub(crate) fn matches(&self, other: &str) -> bool {
        self.hex() == other
    }
}

/// Compute the digest of an in-memory buffer.
pub(crate) fn digest_bytes(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    ContentDigest::new(hasher.finalize().into(), bytes.len() as u64)
}

/// Compute the digest of a whole source by walking it in chunks.
pub(crate) async fn digest_source(source: &dyn RangedSource) -> io::Result<ContentDigest> {
    let total = source.len();
    let mut hasher = Sha1::new();
    let mut position = 0;

    while position < total {
        let length = DIGEST_CHUNK.min(total - position);
        let chunk = source.read_at(position, length).await?;
        hasher.update(&chunk);
        position += length;
    }

    Ok(ContentDigest::new(hasher.finalize().into(), total))
}

/// A byte source that hands out independent views of its ranges.
#[async_trait]
pub trait RangedSource: Send + Sync {
    /// Total number of bytes in the source.
    fn len(&self) -> u64;

    /// Whether the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly the bytes in `[position, position + length)`.
    async fn read_at(&self, position: u64, length: u64) -> io::Result<Bytes>;
}

#[async_trait]
impl RangedSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    async fn read_at(&self, position: u64, length: u64) -> io::Result<Bytes> {
        let end = position + length;
        if end > Bytes::len(self) as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "range extends past the end of the buffer",
            ));
        }
        Ok(self.slice(position as usize..end as usize))
    }
}

/// A source backed by a file on disk; every read opens its own handle, so
/// concurrent part reads never contend on a shared cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: Utf8PathBuf,
    length: u64,
}

impl FileSource {
    /// Open a file as a ranged source, capturing its current length.
    pub async fn open(path: impl Into<Utf8PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        Ok(FileSource {
            path,
            length: metadata.len(),
        })
    }

    /// The path this source reads from.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

#[async_trait]
impl RangedSource for FileSource {
    fn len(&self) -> u64 {
        self.length
    }

    async fn read_at(&self, position: u64, length: u64) -> io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(io::SeekFrom::Start(position)).await?;

        let mut buffer = Vec::with_capacity(length as usize);
        let read = file
            .take(length)
            .read_to_end(&mut buffer)
            .await? as u64;

        if read != length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while it was being read",
            ));
        }

        Ok(Bytes::from(buffer))
    }
}

/// A byte sink that accepts positioned writes.
#[async_trait]
pub trait RangedSink: Send + Sync {
    /// Write `data` at `position`, growing the sink as needed.
    async fn write_at(&self, position: u64, data: Bytes) -> io::Result<()>;
}

/// A sink backed by a file on disk; every write opens its own handle and
/// seeks, so concurrent part writes never contend on a shared cursor.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: Utf8PathBuf,
}

impl FileSink {
    /// Write downloaded content to the file at `path`, creating it when
    /// missing.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        FileSink { path: path.into() }
    }

    /// The path this sink writes to.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

#[async_trait]
impl RangedSink for FileSink {
    async fn write_at(&self, position: u64, data: Bytes) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .await?;

        file.seek(io::SeekFrom::Start(position)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// An in-memory sink, mostly useful in tests and for small downloads.
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Mutex<Vec<u8>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the assembled content.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.buffer.lock().clone())
    }
}

#[async_trait]
impl RangedSink for MemorySink {
    async fn write_at(&self, position: u64, data: Bytes) -> io::Result<()> {
        let mut buffer = self.buffer.lock();
        let end = position as usize + data.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[position as usize..end].copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_source_reads_ranges() {
        let source = Bytes::from_static(b"0123456789");

        assert_eq!(RangedSource::len(&source), 10);
        assert_eq!(source.read_at(0, 4).await.unwrap().as_ref(), b"0123");
        assert_eq!(source.read_at(7, 3).await.unwrap().as_ref(), b"789");
        assert!(source.read_at(8, 3).await.is_err());
    }

    #[tokio::test]
    async fn digest_matches_known_vector() {
        let source = Bytes::from_static(b"hello");
        let digest = digest_source(&source).await.unwrap();

        assert_eq!(digest.hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(digest.length(), 5);
        assert!(digest.matches("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"));
    }

    #[tokio::test]
    async fn digest_agrees_between_whole_and_chunked_paths() {
        let content: Vec<u8> = (0..3 * 1024 * 1024u32).map(|n| n as u8).collect();
        let source = Bytes::from(content.clone());

        let streamed = digest_source(&source).await.unwrap();
        let whole = digest_bytes(&content);

        assert_eq!(streamed.hex(), whole.hex());
        assert_eq!(streamed.length(), whole.length());
    }

    #[tokio::test]
    async fn memory_sink_assembles_out_of_order_writes() {
        let sink = MemorySink::new();
        sink.write_at(5, Bytes::from_static(b"56789")).await.unwrap();
        sink.write_at(0, Bytes::from_static(b"01234")).await.unwrap();

        assert_eq!(sink.to_bytes().as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn file_round_trip_through_source_and_sink() {
        let dir = std::env::temp_dir().join("b2-transfer-io-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.join("roundtrip.bin")).unwrap();

        let sink = FileSink::new(path.clone());
        sink.write_at(3, Bytes::from_static(b"def")).await.unwrap();
        sink.write_at(0, Bytes::from_static(b"abc")).await.unwrap();

        let source = FileSource::open(path.clone()).await.unwrap();
        assert_eq!(RangedSource::len(&source), 6);
        assert_eq!(source.read_at(0, 6).await.unwrap().as_ref(), b"abcdef");

        std::fs::remove_file(path).unwrap();
    }
}
