use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::checksum::Checksum;
use crate::network::TransportError;
use crate::protocol::ProtocolError;
use crate::store::StoreError;

pub mod flow;
pub mod receiver;
pub mod sender;

pub use flow::SendPermit;
pub use receiver::{ReceiveSummary, ReceivingEngine, Step};
pub use sender::{SendSummary, SenderEvent, SenderPhase, SendingEngine};

const PART_SUFFIX: &str = "part";

/// Streams one attachment in fixed-size chunks.
///
/// The running checksum starts with the attachment id, so after the last
/// chunk it covers `identifier ‖ content`.
pub struct FileChunker {
    file: File,
    path: PathBuf,
    chunk_size: usize,
    total_size: u64,
    bytes_read: u64,
    checksum: Checksum,
}

impl FileChunker {
    /// Open `path`, fixing the size that the frame header will declare
    pub async fn open(path: &Path, id: &Uuid, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path).await?;
        let total_size = file.metadata().await?.len();
        let mut checksum = Checksum::new();
        checksum.update(id.as_bytes());

        Ok(Self {
            file,
            path: path.to_path_buf(),
            chunk_size,
            total_size,
            bytes_read: 0,
            checksum,
        })
    }

    /// Read the next chunk, `None` once the declared size has been read
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        let remaining = self.total_size - self.bytes_read;
        if remaining == 0 {
            return Ok(None);
        }

        let want = remaining.min(self.chunk_size as u64) as usize;
        let mut buffer = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                return Err(TransferError::FileShrunk {
                    path: self.path.display().to_string(),
                    expected: self.total_size,
                    read: self.bytes_read + filled as u64,
                });
            }
            filled += n;
        }

        self.checksum.update(&buffer);
        self.bytes_read += want as u64;
        Ok(Some(Bytes::from(buffer)))
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Checksum for the trailer
    pub fn finish(self) -> u32 {
        self.checksum.finalize()
    }
}

/// Receives one attachment into `<destination>.part`.
///
/// The file only appears under its final name, and under any extra copy
/// paths, once `commit` has verified length and checksum.
pub struct FileWriter {
    file: File,
    part: PathBuf,
    destination: PathBuf,
    copies: Vec<PathBuf>,
    bytes_written: u64,
    expected_size: u64,
    checksum: Checksum,
}

impl FileWriter {
    pub async fn create(destination: &Path, id: &Uuid, expected_size: u64) -> io::Result<Self> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(destination);
        let file = File::create(&part).await?;
        let mut checksum = Checksum::new();
        checksum.update(id.as_bytes());

        Ok(Self {
            file,
            part,
            destination: destination.to_path_buf(),
            copies: Vec::new(),
            bytes_written: 0,
            expected_size,
            checksum,
        })
    }

    /// Also place the verified file at each of `copies`
    pub fn with_copies(mut self, copies: Vec<PathBuf>) -> Self {
        self.copies = copies;
        self
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.checksum.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Move the file into place if it matches `expected_checksum`.
    ///
    /// Returns `false`, leaving nothing behind, on a mismatch.
    pub async fn commit(mut self, expected_checksum: u32) -> io::Result<bool> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let actual = self.checksum.value();
        if self.bytes_written != self.expected_size || actual != expected_checksum {
            tracing::debug!(
                expected = expected_checksum,
                actual,
                bytes = self.bytes_written,
                "discarding attachment"
            );
            self.discard().await;
            return Ok(false);
        }
        drop(self.file);
        tokio::fs::rename(&self.part, &self.destination).await?;
        for copy in &self.copies {
            if let Err(e) = place_copy(&self.destination, copy).await {
                tracing::warn!(path = %copy.display(), error = %e, "failed to copy attachment");
            }
        }
        Ok(true)
    }

    /// Remove the partial file
    pub async fn discard(self) {
        let part = self.part;
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&part).await {
            tracing::debug!(path = %part.display(), error = %e, "failed to remove partial file");
        }
    }
}

async fn place_copy(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await?;
    Ok(())
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PART_SUFFIX);
    destination.with_file_name(name)
}

/// Whether `path` is an unfinished download
pub fn is_partial(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == PART_SUFFIX)
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("{path} shrank to {read} bytes while {expected} were declared")]
    FileShrunk {
        path: String,
        expected: u64,
        read: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("background task failed: {0}")]
    Worker(String),
}

/// Run a blocking store call off the async executor
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, TransferError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::Worker(e.to_string()))?
        .map_err(TransferError::from)
}
