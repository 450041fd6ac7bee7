//! HTTP surface: the invocation RPC and the delivery endpoint.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    routing::{any, get, post},
};
use tracing::info;

use crate::delivery;
use crate::error::{ClipError, ClipResult};
use crate::invoke::Invoker;
use crate::media::{DownloadRequest, InvocationResponse};
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub invoker: Arc<Invoker>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/video", post(get_video))
        .route("/api/download", any(delivery::download))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Runs the downloader for the JSON request in `body` and answers with the
/// generated file name. An empty or `null` body answers `{"res": null}`
/// without touching yt-dlp.
pub async fn get_video(
    State(state): State<AppState>,
    body: Bytes,
) -> ClipResult<Json<InvocationResponse>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Json(InvocationResponse { res: None }));
    }
    let request: Option<DownloadRequest> = serde_json::from_slice(&body)
        .map_err(|err| ClipError::validation(format!("invalid request body: {err}")))?;
    let Some(request) = request else {
        return Ok(Json(InvocationResponse { res: None }));
    };

    let clip = request.validate()?;
    let generated = state.invoker.invoke(&clip).await?;
    info!(file = %generated.path, file_type = %generated.file_type, "invocation finished");
    Ok(Json(InvocationResponse {
        res: Some(generated.path),
    }))
}
