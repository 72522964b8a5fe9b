//! src/services/receiver_service.rs
//!
//! ReceiverService: the server half of the chunk protocol. Chunk payloads
//! are appended to a staging file under `upload_dir`, session cursors are
//! tracked in SQLite, and the terminal chunk renames the staging file into
//! its permanent, time-derived name.

use crate::{
    models::{
        artifact::Artifact,
        chunk::{Acknowledgment, ChunkParams, OpenSessionRequest},
        session::{SessionState, StagingSession},
    },
    services::key_locks::KeyLocks,
    wire::{self, WireError},
};
use chrono::Utc;
use md5::Context;
use sqlx::{Executor, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind, SeekFrom},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_FILENAME_LEN: usize = 255;
const STAGING_PREFIX: &str = "tmp_";

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("bad chunk request: {0}")]
    BadRequest(String),
    #[error("upload `{key}` out of sequence: {reason}")]
    Sequence { key: String, reason: String },
    #[error("upload `{key}` reassembled {actual} bytes but {expected} were declared")]
    SizeMismatch {
        key: String,
        expected: i64,
        actual: i64,
    },
    #[error("artifact `{0}` not found")]
    ArtifactNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<WireError> for ReceiverError {
    fn from(err: WireError) -> Self {
        ReceiverError::BadRequest(err.to_string())
    }
}

pub type ReceiverResult<T> = Result<T, ReceiverError>;

fn sequence_error(key: &str, reason: impl Into<String>) -> ReceiverError {
    ReceiverError::Sequence {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Identity correlating the chunks of one logical upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StagingKey {
    /// Token issued by `open_session` and echoed on every chunk.
    Session(Uuid),
    /// md5(filename + client address), for clients without a token.
    Address(String),
}

impl StagingKey {
    pub fn resolve(params: &ChunkParams, client_ip: IpAddr) -> ReceiverResult<Self> {
        match params.session.as_deref() {
            Some(token) => Uuid::parse_str(token)
                .map(StagingKey::Session)
                .map_err(|_| ReceiverError::BadRequest(format!("invalid session token `{}`", token))),
            None => Ok(StagingKey::address(&params.name, client_ip)),
        }
    }

    /// Address key for `filename` uploaded from `client_ip`.
    pub fn address(filename: &str, client_ip: IpAddr) -> Self {
        StagingKey::Address(wire::address_staging_digest(filename, client_ip))
    }

    /// Row key and staging file stem. The two key kinds live in disjoint
    /// namespaces; an md5 digest is also a valid uuid.
    pub fn id(&self) -> String {
        match self {
            StagingKey::Session(id) => format!("s_{}", id.simple()),
            StagingKey::Address(digest) => format!("a_{}", digest),
        }
    }
}

/// ReceiverService accepts one chunk per call and drives the per-key state
/// machine `pending -> accumulating -> finalized` (or `aborted`).
///
/// Cloning is cheap; all clones share the pool, the upload directory and the
/// per-key locks.
#[derive(Clone)]
pub struct ReceiverService {
    /// Shared SQLite pool holding session cursors and artifact records.
    pub db: Arc<SqlitePool>,

    /// Directory holding both staging and final artifacts.
    pub upload_dir: PathBuf,

    pub(crate) locks: KeyLocks,
}

impl ReceiverService {
    pub fn new(db: Arc<SqlitePool>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            upload_dir: upload_dir.into(),
            locks: KeyLocks::new(),
        }
    }

    /// Path of the staging file for a key.
    pub fn staging_path(&self, key_id: &str, extension: Option<&str>) -> PathBuf {
        self.upload_dir.join(wire::with_extension(
            &format!("{}{}", STAGING_PREFIX, key_id),
            extension,
        ))
    }

    /// Path a final artifact is served from.
    pub fn artifact_path(&self, final_filename: &str) -> PathBuf {
        self.upload_dir.join(final_filename)
    }

    fn validate_filename(name: &str) -> ReceiverResult<Option<String>> {
        if name.is_empty() {
            return Err(ReceiverError::BadRequest("filename is empty".into()));
        }
        if name.len() > MAX_FILENAME_LEN {
            return Err(ReceiverError::BadRequest("filename is too long".into()));
        }
        if name.chars().any(|c| c.is_control()) {
            return Err(ReceiverError::BadRequest(
                "filename contains control characters".into(),
            ));
        }
        Ok(wire::extension_of(name))
    }

    fn validate_counts(index: u64, total: u64) -> ReceiverResult<()> {
        if total == 0 {
            return Err(ReceiverError::BadRequest("totalChunks must be at least 1".into()));
        }
        if index >= total {
            return Err(ReceiverError::BadRequest(format!(
                "chunk index {} is outside 0..{}",
                index, total
            )));
        }
        if i64::try_from(total).is_err() {
            return Err(ReceiverError::BadRequest("totalChunks is too large".into()));
        }
        Ok(())
    }

    fn declared_size(size: Option<u64>) -> ReceiverResult<Option<i64>> {
        size.map(|s| {
            i64::try_from(s).map_err(|_| ReceiverError::BadRequest("size is too large".into()))
        })
        .transpose()
    }

    /// Issue a session token for an upload that is about to start.
    pub async fn open_session(&self, req: OpenSessionRequest) -> ReceiverResult<Uuid> {
        let extension = Self::validate_filename(&req.name)?;
        Self::validate_counts(0, req.total_chunks)?;
        let declared_size = Self::declared_size(req.size)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let session = StagingSession {
            staging_key: StagingKey::Session(id).id(),
            filename: req.name,
            extension,
            declared_size,
            total_chunks: req.total_chunks as i64,
            next_chunk_index: 0,
            bytes_received: 0,
            state: SessionState::Pending,
            final_filename: None,
            created_at: now,
            updated_at: now,
        };
        upsert_session(&*self.db, &session).await?;
        info!(session = %id, file = %session.filename, "opened upload session");
        Ok(id)
    }

    /// Accept one chunk.
    ///
    /// `body` is the raw request body (a base64 data URL). Parameters and
    /// payload are validated before anything on disk or in SQLite changes.
    pub async fn receive(
        &self,
        params: ChunkParams,
        client_ip: IpAddr,
        body: &[u8],
    ) -> ReceiverResult<Acknowledgment> {
        let extension = Self::validate_filename(&params.name)?;
        Self::validate_counts(params.current_chunk_index, params.total_chunks)?;
        let declared_size = Self::declared_size(params.size)?;
        let payload = wire::decode_data_url(body)?;

        let key = StagingKey::resolve(&params, client_ip)?;
        let key_id = key.id();
        let _guard = self.locks.acquire(&key_id).await;

        let existing = self.fetch_session(&key_id).await?;
        if let StagingKey::Session(_) = key {
            let Some(session) = existing.as_ref() else {
                return Err(sequence_error(&key_id, "unknown upload session"));
            };
            if session.filename != params.name {
                return Err(ReceiverError::BadRequest(format!(
                    "session was opened for `{}`, not `{}`",
                    session.filename, params.name
                )));
            }
            if session.total_chunks != params.total_chunks as i64 {
                return Err(sequence_error(
                    &key_id,
                    format!(
                        "session declared {} chunks, request declares {}",
                        session.total_chunks, params.total_chunks
                    ),
                ));
            }
            if let (Some(opened), Some(now)) = (session.declared_size, declared_size) {
                if opened != now {
                    return Err(ReceiverError::BadRequest(format!(
                        "session declared {} bytes, request declares {}",
                        opened, now
                    )));
                }
            }
            // Single-chunk uploads: a resent chunk 0 is also the terminal one.
            if session.state == SessionState::Finalized && params.is_first() && params.is_last() {
                if let Some(name) = session.final_filename.as_deref() {
                    debug!(key = %key_id, "replaying terminal acknowledgment");
                    return Ok(Acknowledgment::terminal(name));
                }
            }
        }

        let index = params.current_chunk_index as i64;
        let mut session = if params.is_first() {
            let now = Utc::now();
            let opened_size = match key {
                StagingKey::Session(_) => existing.as_ref().and_then(|s| s.declared_size),
                StagingKey::Address(_) => None,
            };
            StagingSession {
                staging_key: key_id.clone(),
                filename: params.name.clone(),
                extension,
                declared_size: declared_size.or(opened_size),
                total_chunks: params.total_chunks as i64,
                next_chunk_index: 0,
                bytes_received: 0,
                state: SessionState::Accumulating,
                final_filename: None,
                created_at: now,
                updated_at: now,
            }
        } else {
            let Some(session) = existing else {
                return Err(sequence_error(
                    &key_id,
                    format!("chunk {} arrived before chunk 0", index),
                ));
            };
            match session.state {
                SessionState::Pending => {
                    return Err(sequence_error(
                        &key_id,
                        format!("chunk {} arrived before chunk 0", index),
                    ));
                }
                SessionState::Aborted => {
                    return Err(sequence_error(
                        &key_id,
                        "upload was aborted; restart from chunk 0",
                    ));
                }
                SessionState::Finalized => {
                    // A resent terminal chunk means the client lost our reply.
                    if let Some(name) = session.final_filename.as_deref() {
                        if params.is_last() && session.total_chunks == params.total_chunks as i64 {
                            debug!(key = %key_id, "replaying terminal acknowledgment");
                            return Ok(Acknowledgment::terminal(name));
                        }
                    }
                    return Err(sequence_error(&key_id, "upload already finalized"));
                }
                SessionState::Accumulating => {}
            }
            if session.total_chunks != params.total_chunks as i64 {
                return Err(sequence_error(
                    &key_id,
                    format!(
                        "totalChunks changed from {} to {}",
                        session.total_chunks, params.total_chunks
                    ),
                ));
            }
            if index == session.next_chunk_index - 1 {
                debug!(key = %key_id, index, "duplicate chunk acknowledged without append");
                return Ok(Acknowledgment::accepted());
            }
            if index != session.next_chunk_index {
                return Err(sequence_error(
                    &key_id,
                    format!("expected chunk {}, got {}", session.next_chunk_index, index),
                ));
            }
            session
        };

        let payload_len = payload.len() as i64;
        if let Some(expected) = session.declared_size {
            if session.bytes_received + payload_len > expected {
                return Err(sequence_error(
                    &key_id,
                    format!(
                        "chunk {} overruns declared size of {} bytes",
                        index, expected
                    ),
                ));
            }
        }

        let staging = self.staging_path(&key_id, session.extension.as_deref());
        if params.is_first() {
            remove_file_if_exists(&staging).await?;
            write_at(&staging, 0, &payload, true).await?;
        } else {
            match write_at(&staging, session.bytes_received as u64, &payload, false).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(sequence_error(&key_id, "staging artifact is missing"));
                }
                Err(err) => return Err(ReceiverError::Io(err)),
            }
        }

        session.bytes_received += payload_len;
        session.next_chunk_index = index + 1;
        session.updated_at = Utc::now();

        if params.is_last() {
            let final_filename = self.finalize(session, &staging).await?;
            return Ok(Acknowledgment::terminal(final_filename));
        }

        upsert_session(&*self.db, &session).await?;
        debug!(
            key = %key_id,
            index,
            total = session.total_chunks,
            bytes = session.bytes_received,
            "appended chunk"
        );
        Ok(Acknowledgment::accepted())
    }

    /// Rename the staging file into its permanent name and record the
    /// artifact. Returns only once both the rename and the metadata are durable.
    async fn finalize(&self, mut session: StagingSession, staging: &Path) -> ReceiverResult<String> {
        if let Some(expected) = session.declared_size {
            if expected != session.bytes_received {
                let actual = session.bytes_received;
                self.abort(&mut session, staging).await?;
                return Err(ReceiverError::SizeMismatch {
                    key: session.staging_key,
                    expected,
                    actual,
                });
            }
        }

        let etag = md5_file(staging).await?;
        let final_filename = wire::final_identifier(session.extension.as_deref());
        let final_path = self.artifact_path(&final_filename);

        session.state = SessionState::Finalized;
        session.final_filename = Some(final_filename.clone());
        let artifact = Artifact {
            id: Uuid::new_v4(),
            final_filename: final_filename.clone(),
            original_filename: session.filename.clone(),
            size_bytes: session.bytes_received,
            etag,
            created_at: session.updated_at,
        };

        fs::rename(staging, &final_path).await?;
        if let Err(err) = self.publish(&session, &artifact).await {
            // Put the staging file back so a resent terminal chunk can finish the upload.
            warn!(key = %session.staging_key, "finalize failed, restoring staging file: {}", err);
            if let Err(rename_err) = fs::rename(&final_path, staging).await {
                warn!(
                    "could not restore {} to {}: {}",
                    final_path.display(),
                    staging.display(),
                    rename_err
                );
            }
            return Err(err);
        }

        info!(
            key = %session.staging_key,
            file = %session.filename,
            final_filename = %final_filename,
            bytes = session.bytes_received,
            "upload finalized"
        );
        Ok(final_filename)
    }

    /// Make the rename durable, then record the finalized session and its
    /// artifact in one transaction.
    async fn publish(&self, session: &StagingSession, artifact: &Artifact) -> ReceiverResult<()> {
        sync_dir(&self.upload_dir).await?;
        self.commit_finalized(session, artifact).await?;
        Ok(())
    }

    async fn commit_finalized(
        &self,
        session: &StagingSession,
        artifact: &Artifact,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.db.begin().await?;
        upsert_session(&mut *tx, session).await?;
        sqlx::query(
            "INSERT INTO artifacts (id, final_filename, original_filename, size_bytes, etag, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(artifact.id)
        .bind(&artifact.final_filename)
        .bind(&artifact.original_filename)
        .bind(artifact.size_bytes)
        .bind(&artifact.etag)
        .bind(artifact.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Discard the staging file and mark the key aborted. Only a new chunk 0
    /// revives it.
    async fn abort(&self, session: &mut StagingSession, staging: &Path) -> ReceiverResult<()> {
        remove_file_if_exists(staging).await?;
        session.state = SessionState::Aborted;
        session.updated_at = Utc::now();
        upsert_session(&*self.db, session).await?;
        warn!(key = %session.staging_key, file = %session.filename, "upload aborted");
        Ok(())
    }

    /// Fetch the record for a staging key, if any.
    pub async fn fetch_session(&self, key_id: &str) -> ReceiverResult<Option<StagingSession>> {
        let session = sqlx::query_as::<_, StagingSession>(
            "SELECT staging_key, filename, extension, declared_size, total_chunks,
                    next_chunk_index, bytes_received, state, final_filename,
                    created_at, updated_at
             FROM staging_sessions WHERE staging_key = ?",
        )
        .bind(key_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// All staging records, oldest activity first.
    pub async fn list_sessions(&self) -> ReceiverResult<Vec<StagingSession>> {
        let sessions = sqlx::query_as::<_, StagingSession>(
            "SELECT staging_key, filename, extension, declared_size, total_chunks,
                    next_chunk_index, bytes_received, state, final_filename,
                    created_at, updated_at
             FROM staging_sessions ORDER BY updated_at ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(sessions)
    }

    pub(crate) async fn delete_session(&self, key_id: &str) -> ReceiverResult<()> {
        sqlx::query("DELETE FROM staging_sessions WHERE staging_key = ?")
            .bind(key_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Look up a completed upload by its final identifier.
    pub async fn artifact(&self, final_filename: &str) -> ReceiverResult<Artifact> {
        sqlx::query_as::<_, Artifact>(
            "SELECT id, final_filename, original_filename, size_bytes, etag, created_at
             FROM artifacts WHERE final_filename = ?",
        )
        .bind(final_filename)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ReceiverError::ArtifactNotFound(final_filename.to_string()))
    }

    /// Open a completed upload for streaming.
    pub async fn open_artifact(&self, final_filename: &str) -> ReceiverResult<(Artifact, File)> {
        let artifact = self.artifact(final_filename).await?;
        let file = File::open(self.artifact_path(&artifact.final_filename))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    ReceiverError::ArtifactNotFound(final_filename.to_string())
                } else {
                    ReceiverError::Io(err)
                }
            })?;
        Ok((artifact, file))
    }
}

async fn upsert_session<'e, E>(executor: E, session: &StagingSession) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO staging_sessions (
            staging_key, filename, extension, declared_size, total_chunks,
            next_chunk_index, bytes_received, state, final_filename,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(staging_key) DO UPDATE SET
            filename = excluded.filename,
            extension = excluded.extension,
            declared_size = excluded.declared_size,
            total_chunks = excluded.total_chunks,
            next_chunk_index = excluded.next_chunk_index,
            bytes_received = excluded.bytes_received,
            state = excluded.state,
            final_filename = excluded.final_filename,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&session.staging_key)
    .bind(&session.filename)
    .bind(&session.extension)
    .bind(session.declared_size)
    .bind(session.total_chunks)
    .bind(session.next_chunk_index)
    .bind(session.bytes_received)
    .bind(session.state)
    .bind(&session.final_filename)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Write `payload` at `offset`, discarding anything past `offset` first so a
/// half-written earlier attempt never survives. Synced before returning.
async fn write_at(path: &Path, offset: u64, payload: &[u8], create: bool) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(create)
        .open(path)
        .await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(payload).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

pub(crate) async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("removed {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

async fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut digest = Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.consume(&buf[..n]);
    }
    Ok(format!("{:x}", digest.compute()))
}

/// Make a rename inside `dir` durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, wire::encode_data_url};
    use tempfile::TempDir;

    const CHUNK: usize = 10_240;

    async fn service() -> (ReceiverService, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect_in_memory().await;
        (ReceiverService::new(Arc::new(pool), dir.path()), dir)
    }

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn params(name: &str, size: u64, index: u64, total: u64) -> ChunkParams {
        ChunkParams {
            name: name.into(),
            size: Some(size),
            current_chunk_index: index,
            total_chunks: total,
            session: None,
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn staging_len(svc: &ReceiverService, name: &str) -> Option<u64> {
        let key = StagingKey::address(name, ip()).id();
        let ext = wire::extension_of(name);
        std::fs::metadata(svc.staging_path(&key, ext.as_deref()))
            .ok()
            .map(|m| m.len())
    }

    async fn upload_all(svc: &ReceiverService, name: &str, data: &[u8]) -> Acknowledgment {
        let total = wire::total_chunks(data.len() as u64, CHUNK as u64);
        let mut last = Acknowledgment::accepted();
        for i in 0..total {
            let r = wire::chunk_range(i, CHUNK as u64, data.len() as u64);
            let body = encode_data_url(&data[r.start as usize..r.end as usize]);
            last = svc
                .receive(params(name, data.len() as u64, i, total), ip(), body.as_bytes())
                .await
                .unwrap();
        }
        last
    }

    #[tokio::test]
    async fn photo_scenario_reassembles_exact_bytes() {
        let (svc, _dir) = service().await;
        let data = sample(25_600);

        for i in 0..2u64 {
            let r = wire::chunk_range(i, CHUNK as u64, 25_600);
            let body = encode_data_url(&data[r.start as usize..r.end as usize]);
            let ack = svc
                .receive(params("photo.png", 25_600, i, 3), ip(), body.as_bytes())
                .await
                .unwrap();
            assert_eq!(ack, Acknowledgment::accepted());
            assert_eq!(staging_len(&svc, "photo.png"), Some((i + 1) * CHUNK as u64));
        }

        let body = encode_data_url(&data[2 * CHUNK..]);
        let ack = svc
            .receive(params("photo.png", 25_600, 2, 3), ip(), body.as_bytes())
            .await
            .unwrap();
        let final_name = ack.final_filename().unwrap().to_string();
        assert_ne!(final_name, "photo.png");
        assert!(final_name.ends_with(".png"));

        let stored = std::fs::read(svc.artifact_path(&final_name)).unwrap();
        assert_eq!(stored, data);
        assert_eq!(staging_len(&svc, "photo.png"), None);

        let artifact = svc.artifact(&final_name).await.unwrap();
        assert_eq!(artifact.size_bytes, 25_600);
        assert_eq!(artifact.original_filename, "photo.png");
        assert_eq!(artifact.etag, format!("{:x}", md5::compute(&data)));
    }

    #[tokio::test]
    async fn resent_chunk_zero_discards_previous_attempt() {
        let (svc, _dir) = service().await;
        let stale = vec![0xAA; CHUNK];
        let fresh = sample(2 * CHUNK);

        svc.receive(params("a.png", fresh.len() as u64, 0, 2), ip(), encode_data_url(&stale).as_bytes())
            .await
            .unwrap();
        svc.receive(
            params("a.png", fresh.len() as u64, 0, 2),
            ip(),
            encode_data_url(&fresh[..CHUNK]).as_bytes(),
        )
        .await
        .unwrap();
        assert_eq!(staging_len(&svc, "a.png"), Some(CHUNK as u64));

        let ack = svc
            .receive(
                params("a.png", fresh.len() as u64, 1, 2),
                ip(),
                encode_data_url(&fresh[CHUNK..]).as_bytes(),
            )
            .await
            .unwrap();
        let stored = std::fs::read(svc.artifact_path(ack.final_filename().unwrap())).unwrap();
        assert_eq!(stored, fresh);
    }

    #[tokio::test]
    async fn malformed_payload_leaves_staging_untouched() {
        let (svc, _dir) = service().await;
        let data = sample(3 * CHUNK);
        svc.receive(params("m.bin", data.len() as u64, 0, 3), ip(), encode_data_url(&data[..CHUNK]).as_bytes())
            .await
            .unwrap();

        for bad in [&b"garbage"[..], b"data:application/octet-stream;base64,@@@"] {
            let err = svc
                .receive(params("m.bin", data.len() as u64, 1, 3), ip(), bad)
                .await
                .unwrap_err();
            assert!(matches!(err, ReceiverError::BadRequest(_)), "{err:?}");
            assert_eq!(staging_len(&svc, "m.bin"), Some(CHUNK as u64));
        }

        // a bad chunk 0 must not truncate the existing staging file either
        let err = svc
            .receive(params("m.bin", data.len() as u64, 0, 3), ip(), b"nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::BadRequest(_)));
        assert_eq!(staging_len(&svc, "m.bin"), Some(CHUNK as u64));
    }

    #[tokio::test]
    async fn invalid_counts_are_bad_requests() {
        let (svc, _dir) = service().await;
        let body = encode_data_url(b"x");
        for (index, total) in [(0, 0), (3, 3), (5, 2)] {
            let err = svc
                .receive(params("c.txt", 1, index, total), ip(), body.as_bytes())
                .await
                .unwrap_err();
            assert!(matches!(err, ReceiverError::BadRequest(_)));
        }
    }

    #[tokio::test]
    async fn chunk_before_initialization_is_sequence_error() {
        let (svc, _dir) = service().await;
        let err = svc
            .receive(params("late.png", 20, 1, 2), ip(), encode_data_url(&[1; 10]).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));
        assert_eq!(staging_len(&svc, "late.png"), None);
    }

    #[tokio::test]
    async fn gaps_are_rejected_and_duplicates_tolerated() {
        let (svc, _dir) = service().await;
        let data = sample(4 * CHUNK);
        let size = data.len() as u64;
        let chunk = |i: usize| encode_data_url(&data[i * CHUNK..(i + 1) * CHUNK]);

        svc.receive(params("g.bin", size, 0, 4), ip(), chunk(0).as_bytes()).await.unwrap();
        svc.receive(params("g.bin", size, 1, 4), ip(), chunk(1).as_bytes()).await.unwrap();

        // retry of chunk 1 after a lost ack: accepted, nothing appended
        let ack = svc
            .receive(params("g.bin", size, 1, 4), ip(), chunk(1).as_bytes())
            .await
            .unwrap();
        assert_eq!(ack, Acknowledgment::accepted());
        assert_eq!(staging_len(&svc, "g.bin"), Some(2 * CHUNK as u64));

        let err = svc
            .receive(params("g.bin", size, 3, 4), ip(), chunk(3).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));

        let err = svc
            .receive(params("g.bin", size, 2, 5), ip(), chunk(2).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));
        assert_eq!(staging_len(&svc, "g.bin"), Some(2 * CHUNK as u64));

        svc.receive(params("g.bin", size, 2, 4), ip(), chunk(2).as_bytes()).await.unwrap();
        let ack = svc
            .receive(params("g.bin", size, 3, 4), ip(), chunk(3).as_bytes())
            .await
            .unwrap();
        let name = ack.final_filename().unwrap().to_string();
        assert_eq!(std::fs::read(svc.artifact_path(&name)).unwrap(), data);

        // resending the terminal chunk replays the same identifier
        let replay = svc
            .receive(params("g.bin", size, 3, 4), ip(), chunk(3).as_bytes())
            .await
            .unwrap();
        assert_eq!(replay.final_filename(), Some(name.as_str()));

        // but anything else against a finalized key is out of sequence
        let err = svc
            .receive(params("g.bin", size, 2, 4), ip(), chunk(2).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));
    }

    #[tokio::test]
    async fn size_mismatch_aborts_upload() {
        let (svc, _dir) = service().await;
        // declares 30 bytes, sends 10 + 10
        svc.receive(params("s.bin", 30, 0, 2), ip(), encode_data_url(&[1; 10]).as_bytes())
            .await
            .unwrap();
        let err = svc
            .receive(params("s.bin", 30, 1, 2), ip(), encode_data_url(&[2; 10]).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiverError::SizeMismatch { expected: 30, actual: 20, .. }
        ));
        assert_eq!(staging_len(&svc, "s.bin"), None);

        let key = StagingKey::address("s.bin", ip()).id();
        let session = svc.fetch_session(&key).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Aborted);

        let err = svc
            .receive(params("s.bin", 30, 1, 2), ip(), encode_data_url(&[2; 10]).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));
    }

    #[tokio::test]
    async fn overrun_is_rejected_before_writing() {
        let (svc, _dir) = service().await;
        svc.receive(params("o.bin", 15, 0, 2), ip(), encode_data_url(&[1; 10]).as_bytes())
            .await
            .unwrap();
        let err = svc
            .receive(params("o.bin", 15, 1, 2), ip(), encode_data_url(&[2; 10]).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));
        assert_eq!(staging_len(&svc, "o.bin"), Some(10));
    }

    #[tokio::test]
    async fn distinct_keys_interleave_without_mixing() {
        let (svc, _dir) = service().await;
        let a = vec![b'a'; 3 * CHUNK];
        let b = vec![b'b'; 3 * CHUNK];
        let other_ip: IpAddr = "10.1.2.3".parse().unwrap();

        let mut names = Vec::new();
        for i in 0..3usize {
            let range = i * CHUNK..(i + 1) * CHUNK;
            let ack_a = svc
                .receive(params("same.txt", a.len() as u64, i as u64, 3), ip(), encode_data_url(&a[range.clone()]).as_bytes())
                .await
                .unwrap();
            let ack_b = svc
                .receive(params("same.txt", b.len() as u64, i as u64, 3), other_ip, encode_data_url(&b[range]).as_bytes())
                .await
                .unwrap();
            if i == 2 {
                names.push(ack_a.final_filename().unwrap().to_string());
                names.push(ack_b.final_filename().unwrap().to_string());
            }
        }
        assert_ne!(names[0], names[1]);
        assert_eq!(std::fs::read(svc.artifact_path(&names[0])).unwrap(), a);
        assert_eq!(std::fs::read(svc.artifact_path(&names[1])).unwrap(), b);
    }

    #[tokio::test]
    async fn session_tokens_separate_same_name_uploads() {
        let (svc, _dir) = service().await;
        let open = |size| OpenSessionRequest {
            name: "dup.png".into(),
            size: Some(size),
            total_chunks: 1,
        };
        let s1 = svc.open_session(open(3)).await.unwrap();
        let s2 = svc.open_session(open(4)).await.unwrap();
        assert_ne!(s1, s2);

        let with_session = |id: Uuid, size| ChunkParams {
            session: Some(id.to_string()),
            ..params("dup.png", size, 0, 1)
        };
        let ack1 = svc
            .receive(with_session(s1, 3), ip(), encode_data_url(b"one").as_bytes())
            .await
            .unwrap();
        let ack2 = svc
            .receive(with_session(s2, 4), ip(), encode_data_url(b"two!").as_bytes())
            .await
            .unwrap();

        let read = |ack: &Acknowledgment| std::fs::read(svc.artifact_path(ack.final_filename().unwrap())).unwrap();
        assert_eq!(read(&ack1), b"one");
        assert_eq!(read(&ack2), b"two!");

        // lost reply on a single-chunk upload: the resend replays, no second artifact
        let replay = svc
            .receive(with_session(s1, 3), ip(), encode_data_url(b"one").as_bytes())
            .await
            .unwrap();
        assert_eq!(replay, ack1);
        let artifacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
            .fetch_one(&*svc.db)
            .await
            .unwrap();
        assert_eq!(artifacts, 2);
    }

    #[tokio::test]
    async fn unknown_or_pending_sessions_are_sequence_errors() {
        let (svc, _dir) = service().await;
        let unknown = ChunkParams {
            session: Some(Uuid::new_v4().to_string()),
            ..params("x.png", 2, 0, 1)
        };
        let err = svc
            .receive(unknown, ip(), encode_data_url(b"xx").as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));

        let id = svc
            .open_session(OpenSessionRequest {
                name: "x.png".into(),
                size: None,
                total_chunks: 2,
            })
            .await
            .unwrap();
        let early = ChunkParams {
            session: Some(id.to_string()),
            size: None,
            ..params("x.png", 0, 1, 2)
        };
        let err = svc
            .receive(early, ip(), encode_data_url(b"xx").as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));

        let wrong_name = ChunkParams {
            session: Some(id.to_string()),
            size: None,
            ..params("y.png", 0, 0, 2)
        };
        let err = svc
            .receive(wrong_name, ip(), encode_data_url(b"xx").as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::BadRequest(_)));
    }

    #[tokio::test]
    async fn empty_file_finalizes_with_single_empty_chunk() {
        let (svc, _dir) = service().await;
        let ack = upload_all(&svc, "empty.txt", &[]).await;
        let name = ack.final_filename().unwrap();
        assert!(name.ends_with(".txt"));
        assert_eq!(std::fs::read(svc.artifact_path(name)).unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn open_artifact_reports_missing() {
        let (svc, _dir) = service().await;
        let err = svc.open_artifact("nope.png").await.unwrap_err();
        assert!(matches!(err, ReceiverError::ArtifactNotFound(_)));

        let ack = upload_all(&svc, "here.png", &sample(100)).await;
        let (artifact, _file) = svc.open_artifact(ack.final_filename().unwrap()).await.unwrap();
        assert_eq!(artifact.size_bytes, 100);
    }

    #[tokio::test]
    async fn session_tokens_cannot_reach_address_keyed_uploads() {
        let (svc, _dir) = service().await;
        let owner: IpAddr = "10.0.0.5".parse().unwrap();
        let intruder: IpAddr = "10.9.9.9".parse().unwrap();

        svc.receive(params("a.png", 10, 0, 2), owner, encode_data_url(b"victim").as_bytes())
            .await
            .unwrap();

        // an md5 digest is a well-formed uuid; it must not address the owner's row
        let digest = wire::address_staging_digest("a.png", owner);
        let forged = ChunkParams {
            session: Some(Uuid::parse_str(&digest).unwrap().to_string()),
            ..params("a.png", 10, 1, 2)
        };
        let err = svc
            .receive(forged, intruder, encode_data_url(b"EVIL").as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sequence { .. }));

        let key = StagingKey::address("a.png", owner).id();
        let session = svc.fetch_session(&key).await.unwrap().unwrap();
        assert_eq!(session.next_chunk_index, 1);
        assert_eq!(session.bytes_received, 6);
        assert_eq!(
            std::fs::read(svc.staging_path(&key, Some("png"))).unwrap(),
            b"victim"
        );
        assert_ne!(StagingKey::Session(Uuid::parse_str(&digest).unwrap()).id(), key);
    }

    #[tokio::test]
    async fn unusual_suffixes_upload_without_extension() {
        let (svc, _dir) = service().await;
        for name in ["v1.2 notes", "John.Smith résumé", "backup.2024-01-01", "photo.jpeg_original"] {
            let ack = upload_all(&svc, name, b"plain bytes").await;
            let final_name = ack.final_filename().unwrap();
            assert!(!final_name.contains('.'), "{} -> {}", name, final_name);
            assert_eq!(std::fs::read(svc.artifact_path(final_name)).unwrap(), b"plain bytes");
        }
    }

    #[tokio::test]
    async fn failed_finalize_restores_staging_for_retry() {
        let (svc, dir) = service().await;
        let data = sample(2 * CHUNK);
        let size = data.len() as u64;
        let chunk = |i: usize| encode_data_url(&data[i * CHUNK..(i + 1) * CHUNK]);

        svc.receive(params("f.bin", size, 0, 2), ip(), chunk(0).as_bytes()).await.unwrap();
        sqlx::query("DROP TABLE artifacts").execute(&*svc.db).await.unwrap();

        let err = svc
            .receive(params("f.bin", size, 1, 2), ip(), chunk(1).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Sqlx(_)));

        // nothing published; the staging file holds every byte received so far
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("tmp_"));
        assert_eq!(staging_len(&svc, "f.bin"), Some(size));
        let key = StagingKey::address("f.bin", ip()).id();
        let session = svc.fetch_session(&key).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Accumulating);
        assert_eq!(session.next_chunk_index, 1);

        db::run_migrations(&svc.db).await.unwrap();
        let ack = svc
            .receive(params("f.bin", size, 1, 2), ip(), chunk(1).as_bytes())
            .await
            .unwrap();
        let name = ack.final_filename().unwrap();
        assert_eq!(std::fs::read(svc.artifact_path(name)).unwrap(), data);
        assert_eq!(svc.artifact(name).await.unwrap().size_bytes, size as i64);
    }

    #[tokio::test]
    async fn same_key_requests_are_serialized() {
        let (svc, _dir) = service().await;
        let data = sample(3 * CHUNK);
        let size = data.len() as u64;
        let chunk = |i: usize| encode_data_url(&data[i * CHUNK..(i + 1) * CHUNK]);
        let key = StagingKey::address("race.bin", ip()).id();

        svc.receive(params("race.bin", size, 0, 3), ip(), chunk(0).as_bytes()).await.unwrap();

        // a request for a held key waits for the holder
        let guard = svc.locks.acquire(&key).await;
        let blocked = {
            let svc = svc.clone();
            let body = chunk(1);
            tokio::spawn(async move {
                svc.receive(params("race.bin", size, 1, 3), ip(), body.as_bytes()).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(staging_len(&svc, "race.bin"), Some(CHUNK as u64));
        drop(guard);
        assert_eq!(blocked.await.unwrap().unwrap(), Acknowledgment::accepted());

        // concurrent copies of the terminal chunk: one finalize, the rest replay it
        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = svc.clone();
            let body = chunk(2);
            handles.push(tokio::spawn(async move {
                svc.receive(params("race.bin", size, 2, 3), ip(), body.as_bytes()).await
            }));
        }
        let mut acks = Vec::new();
        for handle in handles {
            acks.push(handle.await.unwrap().unwrap());
        }
        assert!(acks.iter().all(|ack| *ack == acks[0]));
        let name = acks[0].final_filename().unwrap();
        assert_eq!(std::fs::read(svc.artifact_path(name)).unwrap(), data);

        let artifacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
            .fetch_one(&*svc.db)
            .await
            .unwrap();
        assert_eq!(artifacts, 1);
        let session = svc.fetch_session(&key).await.unwrap().unwrap();
        assert_eq!(session.next_chunk_index, 3);
        assert_eq!(session.bytes_received, size as i64);
    }

    #[tokio::test]
    async fn storage_failure_is_io_error_and_keeps_cursor() {
        use crate::errors::{AppError, ErrorKind as AppErrorKind};
        use axum::http::StatusCode;

        let (svc, dir) = service().await;
        svc.receive(params("io.bin", 20, 0, 2), ip(), encode_data_url(&[1; 10]).as_bytes())
            .await
            .unwrap();

        // the staging path turns into a directory: appends fail with an I/O error
        let key = StagingKey::address("io.bin", ip()).id();
        let staging = svc.staging_path(&key, Some("bin"));
        std::fs::remove_file(&staging).unwrap();
        std::fs::create_dir(&staging).unwrap();

        let err = svc
            .receive(params("io.bin", 20, 1, 2), ip(), encode_data_url(&[2; 10]).as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Io(_)), "{:?}", err);

        let session = svc.fetch_session(&key).await.unwrap().unwrap();
        assert_eq!(session.next_chunk_index, 1);
        assert_eq!(session.bytes_received, 10);

        let app = AppError::from(err);
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(app.kind, AppErrorKind::IoFailure);

        // an upload dir that is not a directory fails chunk 0 the same way
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let broken = ReceiverService::new(svc.db.clone(), &blocker);
        let err = broken
            .receive(params("io2.bin", 3, 0, 1), ip(), encode_data_url(b"abc").as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiverError::Io(_)), "{:?}", err);
        let key2 = StagingKey::address("io2.bin", ip()).id();
        assert!(svc.fetch_session(&key2).await.unwrap().is_none());
    }
}
