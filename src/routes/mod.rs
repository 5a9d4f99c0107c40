//! HTTP route handlers.
//!
//! | Method | Path                              | Description                     |
//! |--------|-----------------------------------|---------------------------------|
//! | GET    | `/bridge/{session_id}/events`     | SSE subscriber stream           |
//! | POST   | `/bridge/{session_id}/send`       | Dispatch one message to handlers|
//!
//! Both require `?token=<session token>`. Auth failures and unknown sessions
//! are a bare `401`, decided before the body is read or the rest of the query
//! is looked at; unknown paths are a bare `404`. CORS is open because the
//! embedding UI is served from an unpredictable local origin.

pub mod events;
pub mod send;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::BridgeServer;

/// The first `token` parameter of a raw query string, percent-decoded.
///
/// Anything else in the query, repeated keys included, is ignored.
pub fn token_param(raw_query: Option<&str>) -> Option<String> {
    let raw = raw_query?;
    let mut url = reqwest::Url::parse("http://127.0.0.1/").ok()?;
    url.set_query(Some(raw));
    url.query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

/// Build the bridge router for `server`.
pub fn router(server: BridgeServer) -> Router {
    Router::new()
        .route("/bridge/{session_id}/events", get(events::event_stream))
        .route("/bridge/{session_id}/send", post(send::send))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}
