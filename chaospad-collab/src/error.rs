//! Snapshot service errors and their HTTP mapping.
//!
//! Error responses are JSON:
//! ```json
//! { "error": "Document not found: abc", "status": 404 }
//! ```
//! Soft failures (empty body, client abort) are not errors; they are reported
//! as a `WriteOutcome` with `ok: false`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The document id is unknown to the directory.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Declared size exceeds the character cap.
    #[error("Content exceeds {max_chars} characters.")]
    PayloadTooLarge { max_chars: u64 },

    /// The received body itself exceeds the transport buffer limit.
    #[error("Snapshot body exceeds {max_bytes} bytes.")]
    BodyTooLarge { max_bytes: usize },

    /// Non-final write inside the minimum interval.
    #[error("Snapshots limited to one every {interval_secs}s.")]
    RateLimited { interval_secs: u64 },

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SnapshotError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SnapshotError::NotFound(_) => StatusCode::NOT_FOUND,
            SnapshotError::PayloadTooLarge { .. } | SnapshotError::BodyTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            SnapshotError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            SnapshotError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
            SnapshotError::Storage(_) | SnapshotError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SnapshotError::RateLimited { .. }
                | SnapshotError::Directory(_)
                | SnapshotError::Storage(_)
        )
    }
}

impl IntoResponse for SnapshotError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Snapshot request failed: {self}");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}
