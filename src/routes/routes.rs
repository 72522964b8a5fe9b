//! Defines routes for the chunk protocol.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST /upload`          - append one chunk (query: name, size, currentChunkIndex, totalChunks, session)
//!   - `POST /upload/sessions` - issue a session token for a new upload
//!
//! - **Serving**
//!   - `GET  /uploads/{final_filename}` - stream a completed upload
//!
//! - **Probes**
//!   - `GET  /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{get_artifact, open_session, upload_chunk},
    },
    services::receiver_service::ReceiverService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header::CONTENT_TYPE},
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Build the router for all upload routes.
///
/// The router carries shared state (`ReceiverService`) to all handlers.
pub fn routes() -> Router<ReceiverService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/upload", post(upload_chunk))
        .route("/upload/sessions", post(open_session))
        .route("/uploads/{final_filename}", get(get_artifact))
}

/// Full application: routes, state, body ceiling and CORS policy.
///
/// `allowed_origin = None` disables cross-origin access entirely.
pub fn app(service: ReceiverService, body_limit: usize, allowed_origin: Option<&str>) -> Router {
    let mut router = routes()
        .with_state(service)
        .layer(DefaultBodyLimit::max(body_limit));

    if let Some(origin) = allowed_origin {
        match HeaderValue::from_str(origin) {
            Ok(value) => {
                let cors = CorsLayer::new()
                    .allow_origin(AllowOrigin::exact(value))
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([CONTENT_TYPE]);
                router = router.layer(cors);
            }
            Err(err) => {
                tracing::warn!("ignoring invalid allowed origin `{}`: {}", origin, err);
            }
        }
    }

    router
}
