//! Server-Sent Events (SSE) endpoint.
//!
//! `GET /bridge/{session_id}/events?token=…`: one subscriber stream per
//! request. The first frame is `event: connected`; after that the stream
//! carries `event: message` frames (reply envelopes and pushed notifications)
//! and comment-only keepalives from the server-wide timer. There is no
//! replay: a reconnecting client sees only what is sent after it attaches.

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};

use super::token_param;
use crate::bridge::BridgeServer;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// `GET /bridge/{session_id}/events`: SSE subscriber stream.
pub async fn event_stream(
    State(server): State<BridgeServer>,
    Path(session_id): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let token = token_param(query.as_deref());
    let Ok(subscription) = server.subscribe(&session_id, token.as_deref()).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    (
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
        ],
        Sse::new(subscription),
    )
        .into_response()
}
