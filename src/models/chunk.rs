//! Wire shapes for the chunk protocol.

use serde::{Deserialize, Serialize};

/// Addressing parameters of one chunk, carried in the query string.
///
/// `POST /upload?name=photo.png&size=25600&currentChunkIndex=0&totalChunks=3`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkParams {
    /// Original filename.
    pub name: String,

    /// Declared file size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Zero-based chunk index.
    pub current_chunk_index: u64,

    /// Declared chunk count, `ceil(size / chunk_size)`.
    pub total_chunks: u64,

    /// Server-issued session token; absent for address-keyed uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl ChunkParams {
    pub fn is_first(&self) -> bool {
        self.current_chunk_index == 0
    }

    pub fn is_last(&self) -> bool {
        self.current_chunk_index + 1 == self.total_chunks
    }
}

/// Receiver reply to one chunk.
///
/// Serialized as JSON `"ok"` for a continuation and as
/// `{"finalFilename": "..."}` once the upload is complete.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Acknowledgment {
    Terminal {
        #[serde(rename = "finalFilename")]
        final_filename: String,
    },
    Continuation(String),
}

impl Acknowledgment {
    pub fn accepted() -> Self {
        Acknowledgment::Continuation("ok".into())
    }

    pub fn terminal(final_filename: impl Into<String>) -> Self {
        Acknowledgment::Terminal {
            final_filename: final_filename.into(),
        }
    }

    pub fn final_filename(&self) -> Option<&str> {
        match self {
            Acknowledgment::Terminal { final_filename } => Some(final_filename),
            Acknowledgment::Continuation(_) => None,
        }
    }
}

/// Body of `POST /upload/sessions`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub total_chunks: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionResponse {
    pub session_id: String,
}
