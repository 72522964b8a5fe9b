//! One file queued for upload.

use crate::wire;
use bytes::Bytes;
use std::{io, path::Path};

/// Where a queued file stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Uploading { chunk_index: u64 },
    Completed,
    /// Terminal failure: retries exhausted or the server rejected the chunk.
    Failed { chunk_index: u64, reason: String },
}

/// A file owned by the caller's queue. Only `final_filename` and `status`
/// are written by the sequencer.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub name: String,
    pub size: u64,
    content: Bytes,
    pub final_filename: Option<String>,
    pub status: TaskStatus,
}

impl UploadTask {
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            name: name.into(),
            size: content.len() as u64,
            content,
            final_filename: None,
            status: TaskStatus::Queued,
        }
    }

    /// Load a file from disk; the task is named after the file name component.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                )
            })?
            .to_string();
        let content = tokio::fs::read(path).await?;
        Ok(Self::new(name, content))
    }

    pub fn total_chunks(&self, chunk_size: u64) -> u64 {
        wire::total_chunks(self.size, chunk_size)
    }

    /// Payload of chunk `index`. Cheap: slices the shared buffer.
    pub fn chunk(&self, index: u64, chunk_size: u64) -> Bytes {
        let range = wire::chunk_range(index, chunk_size, self.size);
        self.content.slice(range.start as usize..range.end as usize)
    }
}
