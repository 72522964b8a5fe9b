//! HTTP handlers for the chunk protocol and for serving finished uploads.
//! Storage and sequencing concerns are delegated to `ReceiverService`.

use crate::{
    errors::AppError,
    models::{
        artifact::Artifact,
        chunk::{Acknowledgment, ChunkParams, OpenSessionRequest, OpenSessionResponse},
    },
    services::receiver_service::ReceiverService,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// `POST /upload?name=&size=&currentChunkIndex=&totalChunks=[&session=]`
///
/// Body is the chunk as a base64 data URL. Replies `"ok"` for intermediate
/// chunks and `{"finalFilename": "..."}` for the last one.
pub async fn upload_chunk(
    State(service): State<ReceiverService>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    query: Result<Query<ChunkParams>, QueryRejection>,
    body: Bytes,
) -> Result<Json<Acknowledgment>, AppError> {
    let Query(params) = query.map_err(|rej| AppError::bad_request(rej.body_text()))?;
    debug!(
        file = %params.name,
        index = params.current_chunk_index,
        total = params.total_chunks,
        peer = %peer,
        body_len = body.len(),
        "chunk received"
    );

    let ack = service.receive(params, peer.ip(), &body).await?;
    Ok(Json(ack))
}

/// `POST /upload/sessions`: issue a session token for a new upload.
pub async fn open_session(
    State(service): State<ReceiverService>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = service.open_session(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(OpenSessionResponse {
            session_id: id.to_string(),
        }),
    ))
}

/// `GET /uploads/{final_filename}`: stream a completed upload.
pub async fn get_artifact(
    State(service): State<ReceiverService>,
    Path(final_filename): Path<String>,
) -> Result<Response, AppError> {
    let (artifact, file) = service.open_artifact(&final_filename).await?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_artifact_headers(response.headers_mut(), &artifact);

    Ok(response)
}

fn set_artifact_headers(headers: &mut HeaderMap, artifact: &Artifact) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );

    let length = artifact.size_bytes.max(0);
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&length.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    let quoted = format!("\"{}\"", artifact.etag);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&artifact.created_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
