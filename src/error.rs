//! Error taxonomy shared by the invocation RPC and the delivery endpoint.

use std::path::PathBuf;

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipError {
    /// Missing or malformed request parameters.
    #[error("{0}")]
    Validation(String),

    #[error("download failed: {0}")]
    ExternalTool(#[from] ToolError),

    /// The requested file is unknown, unsafe or unreadable at serve time.
    #[error("{0}")]
    Delivery(String),

    /// Post-serve deletion failed. Only ever logged, the response is gone.
    #[error("failed to remove {}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("could not start {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yt-dlp exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    /// yt-dlp finished without moving a file into place. This is what a
    /// download rejected by the size ceiling looks like.
    #[error("yt-dlp produced no file (size limit {max_filesize} exceeded or nothing to download)")]
    NoOutput { max_filesize: String },

    #[error("yt-dlp did not finish within {secs}s")]
    Timeout { secs: u64 },

    #[error("unexpected yt-dlp output: {0}")]
    UnexpectedOutput(String),
}

impl ClipError {
    pub fn validation(message: impl Into<String>) -> Self {
        ClipError::Validation(message.into())
    }

    pub fn delivery(message: impl Into<String>) -> Self {
        ClipError::Delivery(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ClipError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ClipError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ClipError::Validation(message) => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                message,
            )
                .into_response(),
            other => {
                let body = serde_json::json!({
                    "error": true,
                    "message": other.to_string(),
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

pub type ClipResult<T> = Result<T, ClipError>;
