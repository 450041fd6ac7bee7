//! `GET /api/download`: streams a generated clip to the client and removes it
//! from storage once the body is closed.
//!
//! The file is deleted when the response body is dropped, whether the client
//! read it to the end or went away halfway. A read error disarms the cleanup
//! so a file that could not be served is left where it is.

use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use tokio::{fs::File, runtime::Handle};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::{ClipError, ClipResult};
use crate::media::FileType;
use crate::server::AppState;
use crate::storage::Storage;

#[derive(Debug, Default, Deserialize)]
pub struct DeliveryParams {
    pub filename: Option<String>,
    pub filetype: Option<String>,
}

pub async fn download(
    method: Method,
    State(state): State<AppState>,
    Query(params): Query<DeliveryParams>,
) -> ClipResult<Response> {
    if method != Method::GET {
        return Ok(method_not_allowed(&method));
    }

    let filename = params
        .filename
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ClipError::validation("Parameter: filename missing"))?;
    let file_type: FileType = params.filetype.as_deref().unwrap_or_default().parse()?;

    serve_and_remove(&state.storage, &filename, file_type).await
}

fn method_not_allowed(method: &Method) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET")],
        format!("Method {method} Not Allowed"),
    )
        .into_response()
}

/// Claims `name` from storage and streams it. Dropping the returned body
/// queues the file for removal on the blocking pool.
pub async fn serve_and_remove(
    storage: &Storage,
    name: &str,
    file_type: FileType,
) -> ClipResult<Response> {
    let (path, issued_as) = storage.claim(name).inspect_err(|_| {
        warn!(file = %name, "refused delivery of unknown file");
    })?;
    if issued_as != file_type {
        debug!(file = %name, requested = %file_type, issued = %issued_as, "file type differs from the one requested at invocation");
    }

    let file = File::open(&path).await.map_err(|err| {
        warn!(path = %path.display(), error = %err, "cannot open clip");
        ClipError::delivery(format!("File not found\n{err}"))
    })?;
    info!(file = %name, content_type = %file_type.content_type(), "streaming clip");

    let mut guard = RemoveOnClose::new(path);
    let stream = ReaderStream::new(file).map(move |chunk| {
        match &chunk {
            Ok(bytes) => guard.sent += bytes.len() as u64,
            Err(err) => guard.disarm(err),
        }
        chunk
    });

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&file_type.content_type()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// Deletes its file on drop unless a read error disarmed it.
struct RemoveOnClose {
    path: PathBuf,
    sent: u64,
    armed: bool,
}

impl RemoveOnClose {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            sent: 0,
            armed: true,
        }
    }

    fn disarm(&mut self, err: &std::io::Error) {
        warn!(path = %self.path.display(), error = %err, "read failed mid-stream, keeping file");
        self.armed = false;
    }
}

impl Drop for RemoveOnClose {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        let sent = self.sent;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_delivered(&path, sent));
            }
            Err(_) => remove_delivered(&path, sent),
        }
    }
}

fn remove_delivered(path: &Path, sent: u64) {
    match remove(path) {
        Ok(()) => info!(path = %path.display(), bytes = sent, "clip delivered and removed"),
        Err(err) => warn!(error = %err, cause = ?std::error::Error::source(&err), "cleanup after delivery failed"),
    }
}

fn remove(path: &Path) -> Result<(), ClipError> {
    std::fs::remove_file(path).map_err(|source| ClipError::Cleanup {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::Invoker;
    use axum::body::to_bytes;
    use std::{fs, sync::Arc, time::Duration};
    use tempfile::{TempDir, tempdir};

    struct Ctx {
        _temp: TempDir,
        state: AppState,
    }

    impl Ctx {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let storage = Arc::new(Storage::open(temp.path().join("clips")).unwrap());
            let invoker = Invoker::new("yt-dlp", "50M", Duration::from_secs(5), storage.clone());
            Self {
                _temp: temp,
                state: AppState {
                    storage,
                    invoker: Arc::new(invoker),
                },
            }
        }

        fn place(&self, name: &str, file_type: FileType, contents: &[u8]) -> PathBuf {
            let path = self.state.storage.dir().join(name);
            fs::write(&path, contents).unwrap();
            self.state.storage.issue(name, file_type);
            path
        }

        async fn request(&self, method: Method, filename: Option<&str>, filetype: Option<&str>) -> Response {
            let params = DeliveryParams {
                filename: filename.map(str::to_string),
                filetype: filetype.map(str::to_string),
            };
            match download(method, State(self.state.clone()), Query(params)).await {
                Ok(response) => response,
                Err(err) => err.into_response(),
            }
        }
    }

    /// Removal runs on the blocking pool, so give it a moment.
    async fn gone(path: &Path) -> bool {
        for _ in 0..100 {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn delivered_file_is_removed_after_streaming() {
        let ctx = Ctx::new();
        let path = ctx.place("0123456789abcdef_vid.mp3", FileType::Mp3, b"ID3 audio");

        let response = ctx
            .request(Method::GET, Some("0123456789abcdef_vid.mp3"), Some("mp3"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mp3");
        assert!(path.exists());

        assert_eq!(body_text(response).await, "ID3 audio");
        assert!(gone(&path).await);
    }

    #[tokio::test]
    async fn video_gets_video_content_type() {
        let ctx = Ctx::new();
        ctx.place("0123456789abcdef_vid.mp4", FileType::Mp4, b"ftyp");
        let response = ctx
            .request(Method::GET, Some("0123456789abcdef_vid.mp4"), Some("mp4"))
            .await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"0123456789abcdef_vid.mp4\""
        );
    }

    #[tokio::test]
    async fn abandoned_download_still_removes_file() {
        let ctx = Ctx::new();
        let path = ctx.place("abandoned.mp4", FileType::Mp4, &vec![7u8; 256 * 1024]);
        let response = ctx.request(Method::GET, Some("abandoned.mp4"), Some("mp4")).await;
        assert_eq!(response.status(), StatusCode::OK);
        drop(response);
        assert!(gone(&path).await);
    }

    #[test]
    fn guard_removes_inline_without_a_runtime() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("offline.mp3");
        fs::write(&path, b"x").unwrap();
        drop(RemoveOnClose::new(path.clone()));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn second_delivery_of_same_name_fails() {
        let ctx = Ctx::new();
        ctx.place("once.mp3", FileType::Mp3, b"x");
        let first = ctx.request(Method::GET, Some("once.mp3"), Some("mp3")).await;
        body_text(first).await;

        let second = ctx.request(Method::GET, Some("once.mp3"), Some("mp3")).await;
        assert_eq!(second.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let payload: serde_json::Value = serde_json::from_str(&body_text(second).await).unwrap();
        assert_eq!(payload["error"], true);
    }

    #[tokio::test]
    async fn traversal_is_rejected_without_streaming() {
        let ctx = Ctx::new();
        let response = ctx
            .request(Method::GET, Some("../../etc/passwd"), Some("mp3"))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = body_text(response).await;
        assert!(!text.contains("root:"));
    }

    #[tokio::test]
    async fn unknown_file_in_storage_is_not_served() {
        let ctx = Ctx::new();
        let path = ctx.state.storage.dir().join("planted.mp4");
        fs::write(&path, b"secret").unwrap();
        let response = ctx.request(Method::GET, Some("planted.mp4"), Some("mp4")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_file_reports_error() {
        let ctx = Ctx::new();
        ctx.state.storage.issue("vanished.mp4", FileType::Mp4);
        let response = ctx.request(Method::GET, Some("vanished.mp4"), Some("mp4")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let payload: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(payload["message"].as_str().unwrap().starts_with("File not found"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn read_error_leaves_path_in_place() {
        let ctx = Ctx::new();
        let path = ctx.state.storage.dir().join("dir.mp4");
        fs::create_dir(&path).unwrap();
        ctx.state.storage.issue("dir.mp4", FileType::Mp4);

        let response = ctx.request(Method::GET, Some("dir.mp4"), Some("mp4")).await;
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_filename_and_bad_filetype_are_validation_errors() {
        let ctx = Ctx::new();
        let response = ctx.request(Method::GET, None, Some("mp3")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Parameter: filename missing");

        let path = ctx.place("kept.wav", FileType::Mp3, b"x");
        let response = ctx.request(Method::GET, Some("kept.wav"), Some("wav")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Filetype wav not supported");
        assert!(path.exists());
        assert!(ctx.state.storage.is_issued("kept.wav"));
    }

    #[tokio::test]
    async fn other_methods_get_405() {
        let ctx = Ctx::new();
        let path = ctx.place("post.mp3", FileType::Mp3, b"x");
        let response = ctx.request(Method::POST, Some("post.mp3"), Some("mp3")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET");
        assert!(path.exists());
    }
}
