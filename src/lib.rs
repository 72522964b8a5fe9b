//! Resumable chunked file upload: an HTTP chunk receiver that reassembles
//! files in a staging area and publishes them under content-independent
//! names, plus the client-side sequencer that feeds it one chunk at a time.

pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod wire;
