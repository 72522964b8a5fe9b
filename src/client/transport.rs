//! How chunks reach the receiver.

use crate::{
    models::chunk::{Acknowledgment, ChunkParams, OpenSessionRequest, OpenSessionResponse},
    wire,
};
use bytes::Bytes;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use std::{future::Future, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransferError {
    #[error("server rejected request ({status} {kind}): {message}")]
    Rejected {
        status: u16,
        kind: String,
        message: String,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no acknowledgment within {0:?}")]
    Stalled(Duration),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransferError {
    /// Whether re-sending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport(_) | TransferError::Stalled(_) => true,
            TransferError::Rejected { status, .. } => {
                *status >= 500
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            TransferError::Protocol(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Transport(err.to_string())
    }
}

/// One chunk on its way out: addressing parameters plus raw bytes.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub params: ChunkParams,
    pub payload: Bytes,
}

/// Seam between the sequencer and the network.
pub trait ChunkTransport {
    /// Ask the receiver for a session token for a new upload.
    fn open_session(
        &self,
        request: &OpenSessionRequest,
    ) -> impl Future<Output = Result<String, TransferError>> + Send;

    /// Send one chunk and wait for its acknowledgment.
    fn send_chunk(
        &self,
        request: &ChunkRequest,
    ) -> impl Future<Output = Result<Acknowledgment, TransferError>> + Send;
}

/// HTTP transport speaking the `/upload` protocol.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    kind: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn rejection(resp: reqwest::Response) -> TransferError {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let (kind, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.kind.unwrap_or_default(), body.error),
            Err(_) => (String::new(), text),
        };
        TransferError::Rejected {
            status: status.as_u16(),
            kind,
            message,
        }
    }
}

impl ChunkTransport for HttpTransport {
    async fn open_session(&self, request: &OpenSessionRequest) -> Result<String, TransferError> {
        let resp = self
            .client
            .post(format!("{}/upload/sessions", self.base_url))
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::rejection(resp).await);
        }

        let body: OpenSessionResponse = resp
            .json()
            .await
            .map_err(|e| TransferError::Protocol(format!("bad session response: {}", e)))?;
        Ok(body.session_id)
    }

    async fn send_chunk(&self, request: &ChunkRequest) -> Result<Acknowledgment, TransferError> {
        let resp = self
            .client
            .post(format!("{}/upload", self.base_url))
            .query(&request.params)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(wire::encode_data_url(&request.payload))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::rejection(resp).await);
        }

        resp.json::<Acknowledgment>()
            .await
            .map_err(|e| TransferError::Protocol(format!("bad acknowledgment: {}", e)))
    }
}
