//! `POST /bridge/{session_id}/send`: inbound messages from the UI surface.
//!
//! The token is checked before the body is read; a body over
//! `max_body_bytes` is then a `413`. A body that does not
//! decode into a known message is a `400` with no handler call and no
//! broadcast. Otherwise the handler runs to completion and its outcome,
//! success or failure, is broadcast as a reply envelope to every subscriber of
//! the session; the HTTP response is `204` either way.

use axum::extract::{Path, RawQuery, Request, State};
use axum::http::StatusCode;
use tracing::debug;

use super::token_param;
use crate::bridge::handlers::dispatch;
use crate::bridge::message::{Inbound, ReplyEnvelope};
use crate::bridge::BridgeServer;

pub async fn send(
    State(server): State<BridgeServer>,
    Path(session_id): Path<String>,
    RawQuery(query): RawQuery,
    request: Request,
) -> StatusCode {
    let token = token_param(query.as_deref());
    let Ok(handlers) = server.authorize(&session_id, token.as_deref()).await else {
        return StatusCode::UNAUTHORIZED;
    };

    let limit = server.config().max_body_bytes;
    let body = match axum::body::to_bytes(request.into_body(), limit).await {
        Ok(body) => body,
        Err(e) => {
            debug!(session_id = %session_id, "Unreadable bridge message body: {e}");
            return StatusCode::PAYLOAD_TOO_LARGE;
        }
    };

    let inbound = match Inbound::decode(&body) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(session_id = %session_id, "Rejected bridge message: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let kind = inbound.message.kind();
    let result = dispatch(handlers.as_ref(), inbound.message).await;
    let envelope = ReplyEnvelope::from_result(inbound.id, result);
    let delivered = server.reply(&session_id, &envelope).await;
    debug!(session_id = %session_id, kind, ok = envelope.ok, delivered, "Dispatched bridge message");

    StatusCode::NO_CONTENT
}
