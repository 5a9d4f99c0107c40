//! HTTP-level behaviour of the bridge routes, driven through the router with
//! `oneshot`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use chatbridge::bridge::handlers::BridgeHandlers;
use chatbridge::bridge::session::{Frame, Subscription};
use chatbridge::config::BridgeConfig;
use chatbridge::error::HandlerError;
use chatbridge::{BridgeServer, SessionInfo};

/// Counts calls; `open_url` fails and `reload_path` panics.
#[derive(Default)]
struct Recording {
    calls: AtomicUsize,
}

#[async_trait]
impl BridgeHandlers for Recording {
    async fn open_file(&self, _path: &str) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open_url(&self, url: &str) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Failed(format!("cannot open {url}")))
    }

    async fn reload_path(&self, _path: &str) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("reload exploded")
    }

    async fn clipboard_write(&self, _text: &str) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn server() -> BridgeServer {
    let server = BridgeServer::new(BridgeConfig::default());
    server.start().await.unwrap();
    server
}

async fn session(server: &BridgeServer, handlers: Arc<Recording>) -> SessionInfo {
    server.create_session(handlers).await.unwrap()
}

async fn send(server: &BridgeServer, uri: &str, body: &str) -> StatusCode {
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    server.router().oneshot(req).await.unwrap().status()
}

/// A subscriber with its `connected` frame already consumed.
async fn subscriber(server: &BridgeServer, info: &SessionInfo) -> Subscription {
    let mut sub = server.subscribe(&info.id, Some(&info.token)).await.unwrap();
    assert!(matches!(sub.recv().await, Some(Frame::Connected { .. })));
    sub
}

async fn next_message(sub: &mut Subscription) -> Value {
    match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
        Ok(Some(Frame::Message(value))) => value,
        other => panic!("expected a message frame, got {other:?}"),
    }
}

fn send_uri(info: &SessionInfo, token: &str) -> String {
    format!("/bridge/{}/send?token={token}", info.id)
}

#[tokio::test]
async fn send_broadcasts_reply_to_every_subscriber_of_that_session_only() {
    let server = server().await;
    let handlers = Arc::new(Recording::default());
    let a = session(&server, Arc::clone(&handlers)).await;
    let b = session(&server, Arc::new(Recording::default())).await;
    let mut a1 = subscriber(&server, &a).await;
    let mut a2 = subscriber(&server, &a).await;
    let mut b1 = subscriber(&server, &b).await;

    let status = send(
        &server,
        &send_uri(&a, &a.token),
        r#"{"id":"req-1","type":"openFile","payload":{"path":"/tmp/x.rs"}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(handlers.calls.load(Ordering::SeqCst), 1);

    for sub in [&mut a1, &mut a2] {
        let reply = next_message(sub).await;
        assert_eq!(reply["replyTo"], "req-1");
        assert_eq!(reply["ok"], true);
        assert!(reply["timestamp"].as_u64().unwrap() > 0);
    }
    assert!(b1.try_recv().is_none());
}

#[tokio::test]
async fn wrong_or_missing_token_is_401_without_side_effects() {
    let server = server().await;
    let handlers = Arc::new(Recording::default());
    let info = session(&server, Arc::clone(&handlers)).await;
    let mut sub = subscriber(&server, &info).await;
    let body = r#"{"id":"x","type":"openFile","payload":{"path":"/a"}}"#;

    for uri in [
        send_uri(&info, "wrong"),
        send_uri(&info, ""),
        format!("/bridge/{}/send", info.id),
        format!("/bridge/no-such-session/send?token={}", info.token),
    ] {
        assert_eq!(send(&server, &uri, body).await, StatusCode::UNAUTHORIZED, "{uri}");
    }
    assert_eq!(handlers.calls.load(Ordering::SeqCst), 0);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn events_with_wrong_token_is_401() {
    let server = server().await;
    let info = session(&server, Arc::new(Recording::default())).await;
    let req = Request::builder()
        .uri(format!("/bridge/{}/events?token=nope", info.id))
        .body(Body::empty())
        .unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.subscriber_count(&info.id).await, 0);
}

#[tokio::test]
async fn events_stream_starts_with_connected() {
    let server = server().await;
    let info = session(&server, Arc::new(Recording::default())).await;
    let req = Request::builder()
        .uri(format!("/bridge/{}/events?token={}", info.id, info.token))
        .body(Body::empty())
        .unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(server.subscriber_count(&info.id).await, 1);

    let mut body = resp.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&first);
    assert!(text.contains("event: connected"), "{text}");
    assert!(text.contains(&info.id), "{text}");

    server.notify(&info.id, json!({"type": "chat.delta", "text": "hi"})).await;
    let next = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&next);
    assert!(text.contains("event: message"), "{text}");
    assert!(text.contains("chat.delta"), "{text}");

    // Dropping the response body unregisters the subscriber.
    drop(body);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.subscriber_count(&info.id).await != 0 {
        assert!(tokio::time::Instant::now() < deadline, "subscriber not removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn malformed_body_is_400_without_dispatch() {
    let server = server().await;
    let handlers = Arc::new(Recording::default());
    let info = session(&server, Arc::clone(&handlers)).await;
    let mut sub = subscriber(&server, &info).await;
    let uri = send_uri(&info, &info.token);

    for body in [
        "not json",
        r#"{"id":"1","payload":{}}"#,
        r#"{"id":"1","type":"launchMissiles","payload":{}}"#,
        r#"{"id":"1","type":"openFile","payload":{"file":"/a"}}"#,
    ] {
        assert_eq!(send(&server, &uri, body).await, StatusCode::BAD_REQUEST, "{body}");
    }
    assert_eq!(handlers.calls.load(Ordering::SeqCst), 0);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn handler_failure_and_panic_broadcast_error_envelopes() {
    let server = server().await;
    let info = session(&server, Arc::new(Recording::default())).await;
    let mut sub = subscriber(&server, &info).await;
    let uri = send_uri(&info, &info.token);

    let status = send(
        &server,
        &uri,
        r#"{"id":"u","type":"openUrl","payload":{"url":"https://example.com"}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let reply = next_message(&mut sub).await;
    assert_eq!(reply["replyTo"], "u");
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"], "cannot open https://example.com");

    let status = send(
        &server,
        &uri,
        r#"{"id":"r","type":"reloadPath","payload":{"path":"/a"}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let reply = next_message(&mut sub).await;
    assert_eq!(reply["replyTo"], "r");
    assert_eq!(reply["ok"], false);

    let status = send(&server, &uri, r#"{"id":"s","type":"uiGetState","payload":{}}"#).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let reply = next_message(&mut sub).await;
    assert_eq!(reply["ok"], false);
    assert!(reply["error"].as_str().unwrap().contains("uiGetState"));
}

#[tokio::test]
async fn unknown_route_is_404() {
    let server = server().await;
    let info = session(&server, Arc::new(Recording::default())).await;
    for uri in [
        format!("/bridge/{}/nope?token={}", info.id, info.token),
        "/".to_string(),
    ] {
        let req = Request::builder().uri(&uri).body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn removed_session_rejects_requests() {
    let server = server().await;
    let info = session(&server, Arc::new(Recording::default())).await;
    assert!(server.remove_session(&info.id).await);
    assert!(!server.remove_session(&info.id).await);
    let status = send(
        &server,
        &send_uri(&info, &info.token),
        r#"{"type":"openFile","payload":{"path":"/a"}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oversized_body_with_wrong_token_is_still_401() {
    let server = server().await;
    let handlers = Arc::new(Recording::default());
    let info = session(&server, Arc::clone(&handlers)).await;
    let big = format!(
        r#"{{"id":"x","type":"openFile","payload":{{"path":"{}"}}}}"#,
        "a".repeat(2 * 1024 * 1024)
    );

    let status = send(&server, &send_uri(&info, "wrong"), &big).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let status = send(&server, &send_uri(&info, &info.token), &big).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(handlers.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_token_params_use_the_first() {
    let server = server().await;
    let handlers = Arc::new(Recording::default());
    let info = session(&server, Arc::clone(&handlers)).await;
    let body = r#"{"id":"x","type":"openFile","payload":{"path":"/a"}}"#;

    let uri = format!("/bridge/{}/send?token=wrong&token=bad", info.id);
    assert_eq!(send(&server, &uri, body).await, StatusCode::UNAUTHORIZED);
    let req = Request::builder()
        .uri(format!("/bridge/{}/events?token=wrong&token=bad", info.id))
        .body(Body::empty())
        .unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(handlers.calls.load(Ordering::SeqCst), 0);

    let uri = format!("/bridge/{}/send?token={}&token=bad", info.id, info.token);
    assert_eq!(send(&server, &uri, body).await, StatusCode::NO_CONTENT);
    assert_eq!(handlers.calls.load(Ordering::SeqCst), 1);
}
