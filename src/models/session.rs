//! Represents a staging session: one in-progress upload and its cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of a staging key.
///
/// `Pending` only exists for server-issued session tokens that have not yet
/// seen chunk 0. `Finalized` and `Aborted` are terminal until a new chunk 0
/// restarts the key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Accumulating,
    Finalized,
    Aborted,
}

/// Server-side record for one staging key.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StagingSession {
    /// Session token (uuid, simple form) or address digest.
    pub staging_key: String,

    /// Original filename as declared by the client.
    pub filename: String,

    /// Extension carried over to the final artifact name.
    pub extension: Option<String>,

    /// File size the client declared, when it did.
    pub declared_size: Option<i64>,

    /// Declared number of chunks for this upload.
    pub total_chunks: i64,

    /// Index the receiver will append next.
    pub next_chunk_index: i64,

    /// Bytes durably appended to the staging file so far.
    pub bytes_received: i64,

    pub state: SessionState,

    /// Set once the staging file has been renamed into place.
    pub final_filename: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Last time a chunk touched this key; drives the idle reaper.
    pub updated_at: DateTime<Utc>,
}
