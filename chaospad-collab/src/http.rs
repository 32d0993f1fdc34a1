//! HTTP snapshot endpoints.
//!
//! - `GET  /api/v1/snapshot/{document_id}` → `{ "exists": bool, "blob_base64": string? }`
//! - `POST /api/v1/snapshot/{document_id}` → `{ "ok": bool, "final": bool, "rate_limited": bool }`
//!
//! The POST body is the raw snapshot blob. Optional headers: `x-final`
//! (`1` or `true`), `x-char-count`, `x-word-count`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SnapshotError;
use crate::gate::SizeHint;
use crate::snapshot::{SnapshotService, Submission, SubmissionBody, WriteOutcome};

pub const HEADER_FINAL: &str = "x-final";
pub const HEADER_CHAR_COUNT: &str = "x-char-count";
pub const HEADER_WORD_COUNT: &str = "x-word-count";

/// Upper bound on buffered snapshot bodies.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Read response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotView {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_base64: Option<String>,
}

pub fn router(service: Arc<SnapshotService>) -> Router {
    Router::new()
        .route(
            "/api/v1/snapshot/{document_id}",
            get(read_snapshot).post(write_snapshot),
        )
        .with_state(service)
}

async fn read_snapshot(
    State(service): State<Arc<SnapshotService>>,
    Path(document_id): Path<String>,
) -> Result<Json<SnapshotView>, SnapshotError> {
    let blob = service.latest(&document_id).await?;
    Ok(Json(SnapshotView {
        exists: blob.is_some(),
        blob_base64: blob.map(|b| BASE64.encode(b)),
    }))
}

async fn write_snapshot(
    State(service): State<Arc<SnapshotService>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<WriteOutcome>), SnapshotError> {
    let body = read_body(&document_id, body, MAX_BODY_BYTES).await;
    let submission = Submission {
        body,
        is_final: is_final(&headers),
        size_hint: size_hint(&headers),
    };

    let outcome = service.submit(&document_id, submission).await?;
    let status = if outcome.ok {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

/// Buffer the request body, stopping at the first chunk past `limit`.
async fn read_body(document_id: &str, body: Body, limit: usize) -> SubmissionBody {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) if buf.len() + chunk.len() > limit => {
                return SubmissionBody::TooLarge { limit };
            }
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(e) => {
                log::debug!("Snapshot body for {document_id} not received: {e}");
                return SubmissionBody::Aborted;
            }
        }
    }
    SubmissionBody::Received(buf.freeze())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_final(headers: &HeaderMap) -> bool {
    header_str(headers, HEADER_FINAL)
        .map(str::trim)
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn size_hint(headers: &HeaderMap) -> SizeHint {
    SizeHint {
        char_count: header_str(headers, HEADER_CHAR_COUNT).map(String::from),
        word_count: header_str(headers, HEADER_WORD_COUNT).map(String::from),
    }
}
