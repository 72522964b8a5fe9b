//! Data models for the chunked upload service.
//!
//! `chunk` holds the wire-facing request/response shapes; `session` and
//! `artifact` map to SQLite rows via `sqlx::FromRow`.

pub mod artifact;
pub mod chunk;
pub mod session;
