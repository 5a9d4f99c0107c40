//! A bridge session: token, injected handlers, and live SSE subscribers.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::sse::Event;
use futures::stream::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::handlers::BridgeHandlers;
use super::BridgeServer;

/// Frames queued per subscriber before it counts as stalled and is dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// One outbound SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Sent once, right after a subscriber registers.
    Connected { session_id: String },
    /// `event: message` carrying a reply envelope or a pushed notification.
    Message(Value),
    /// Comment-only keepalive.
    Ping,
}

impl Frame {
    pub fn into_event(self) -> Event {
        match self {
            Frame::Connected { session_id } => Event::default()
                .event("connected")
                .data(json!({ "sessionId": session_id }).to_string()),
            Frame::Message(value) => Event::default().event("message").data(value.to_string()),
            Frame::Ping => Event::default().comment("ping"),
        }
    }
}

/// Registry entry for one UI surface.
pub struct BridgeSession {
    pub(crate) token: String,
    pub(crate) handlers: Arc<dyn BridgeHandlers>,
    subscribers: HashMap<u64, mpsc::Sender<Frame>>,
}

impl BridgeSession {
    pub(crate) fn new(token: String, handlers: Arc<dyn BridgeHandlers>) -> Self {
        Self {
            token,
            handlers,
            subscribers: HashMap::new(),
        }
    }

    pub(crate) fn add_subscriber(&mut self, id: u64, tx: mpsc::Sender<Frame>) {
        self.subscribers.insert(id, tx);
    }

    pub(crate) fn remove_subscriber(&mut self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Send `frame` to every subscriber, dropping those whose stream is gone
    /// or whose queue is full. Returns the number that accepted it.
    pub(crate) fn send_all(&mut self, frame: &Frame) -> usize {
        self.subscribers
            .retain(|_, tx| tx.try_send(frame.clone()).is_ok());
        self.subscribers.len()
    }

    /// Close every subscriber stream.
    pub(crate) fn close(&mut self) {
        self.subscribers.clear();
    }
}

/// The receiving end of one SSE subscriber.
///
/// Yields [`Event`]s when used as a stream; tests read raw [`Frame`]s through
/// [`recv`](Self::recv). Dropping it (the HTTP connection went away)
/// unregisters the subscriber.
pub struct Subscription {
    session_id: String,
    subscriber_id: u64,
    rx: mpsc::Receiver<Frame>,
    server: BridgeServer,
}

impl Subscription {
    pub(crate) fn new(
        session_id: String,
        subscriber_id: u64,
        rx: mpsc::Receiver<Frame>,
        server: BridgeServer,
    ) -> Self {
        Self {
            session_id,
            subscriber_id,
            rx,
            server,
        }
    }

    /// Next frame, or `None` once the session closed this subscriber.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|frame| frame.map(|f| Ok(f.into_event())))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let server = self.server.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let subscriber_id = self.subscriber_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                server.remove_subscriber(&session_id, subscriber_id).await;
            });
        }
    }
}
