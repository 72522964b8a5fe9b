//! Represents a completed upload (final artifact) on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A finalized upload. The payload lives at `upload_dir/{final_filename}` and
/// is never modified after the rename that created it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Artifact {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Time-derived identifier assigned at completion (`<md5>.<ext>`).
    pub final_filename: String,

    /// Filename the client uploaded under.
    pub original_filename: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the reassembled payload.
    pub etag: String,

    /// When the upload was finalized.
    pub created_at: DateTime<Utc>,
}
