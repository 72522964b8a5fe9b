//! Wire-level helpers shared by the receiver and the sequencer.
//!
//! Chunk payloads travel as data URLs (`data:<mime>;base64,<payload>`); the
//! server strips the prefix up to the first comma before decoding. Chunk
//! arithmetic and artifact naming live here so both sides agree on them.

use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use std::{
    net::IpAddr,
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;

/// Chunk size used by the reference browser client (10 KiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024;

const DATA_URL_MIME: &str = "application/octet-stream";
const MAX_EXTENSION_LEN: usize = 16;

static FINAL_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("payload is not a data URL")]
    MissingDataUrlPrefix,
    #[error("payload data URL is not base64 encoded")]
    NotBase64DataUrl,
    #[error("payload is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Number of chunks needed to transmit `len` bytes.
///
/// An empty file still travels as one (empty) chunk so that the receiver
/// always sees a terminal index.
pub fn total_chunks(len: u64, chunk_size: u64) -> u64 {
    if len == 0 {
        return 1;
    }
    len.div_ceil(chunk_size.max(1))
}

/// Byte range of chunk `index`, clamped to the file length.
pub fn chunk_range(index: u64, chunk_size: u64, len: u64) -> Range<u64> {
    let start = index.saturating_mul(chunk_size).min(len);
    let end = start.saturating_add(chunk_size).min(len);
    start..end
}

/// Encode raw chunk bytes the way a browser `FileReader::readAsDataURL` does.
pub fn encode_data_url(bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        DATA_URL_MIME,
        general_purpose::STANDARD.encode(bytes)
    )
}

/// Decode a data URL request body into raw chunk bytes.
pub fn decode_data_url(body: &[u8]) -> Result<Vec<u8>, WireError> {
    let text = std::str::from_utf8(body).map_err(|_| WireError::InvalidUtf8)?;
    let (prefix, data) = text
        .split_once(',')
        .ok_or(WireError::MissingDataUrlPrefix)?;
    if !prefix.starts_with("data:") {
        return Err(WireError::MissingDataUrlPrefix);
    }
    if !prefix.ends_with(";base64") {
        return Err(WireError::NotBase64DataUrl);
    }

    general_purpose::STANDARD
        .decode(data.trim_end())
        .map_err(|err| WireError::InvalidBase64(err.to_string()))
}

/// Extension of `filename` (text after the last dot), if it is safe to
/// carry into on-disk names: non-empty, short and ASCII alphanumeric.
/// Any other suffix is treated as part of the name and dropped.
pub fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let safe = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    safe.then(|| ext.to_string())
}

/// Staging digest for clients that do not use session tokens:
/// md5 of the original filename concatenated with the client address.
pub fn address_staging_digest(filename: &str, ip: IpAddr) -> String {
    format!("{:x}", md5::compute(format!("{}{}", filename, ip)))
}

/// Permanent, content-independent name for a completed upload.
///
/// Derived from the completion time plus a process-wide counter so two
/// uploads finishing within the same clock tick still get distinct names.
pub fn final_identifier(extension: Option<&str>) -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1000));
    let seq = FINAL_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let digest = md5::compute(format!("{}:{}", nanos, seq));
    with_extension(&format!("{:x}", digest), extension)
}

pub(crate) fn with_extension(stem: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem.to_string(),
    }
}
