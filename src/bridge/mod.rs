//! Session-multiplexed loopback bridge between a UI surface and this process.
//!
//! [`BridgeServer`] is the single authority for bridge sessions. It owns the
//! listener (bound once, to an ephemeral loopback port), the session registry
//! and the process-wide keepalive timer. Each session is reached under
//! `/bridge/{session_id}/…` with its own token; see [`crate::routes`].
//!
//! ## Concurrency
//!
//! The registry is behind an `RwLock`. Authorisation takes a read lock;
//! subscribe, broadcast and removal take the write lock only long enough to
//! touch the subscriber map. Handlers run with no lock held.

pub mod handlers;
pub mod message;
pub mod session;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{generate_token, token_matches};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use handlers::BridgeHandlers;
use message::ReplyEnvelope;
use session::{BridgeSession, Frame, Subscription, SUBSCRIBER_QUEUE};

/// What a UI surface needs to reach its session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    /// `http://127.0.0.1:<port>/bridge/<id>`; append `/events` or `/send`.
    pub base_url: String,
    pub token: String,
}

/// How long `stop` waits for open connections to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
}

struct Inner {
    config: BridgeConfig,
    sessions: RwLock<HashMap<String, BridgeSession>>,
    running: Mutex<Option<Running>>,
    next_subscriber: AtomicU64,
}

/// Loopback HTTP + SSE listener and session registry.
///
/// Cloneable; all clones share the same registry and listener.
#[derive(Clone)]
pub struct BridgeServer {
    inner: Arc<Inner>,
}

impl BridgeServer {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: RwLock::new(HashMap::new()),
                running: Mutex::new(None),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Axum router serving the bridge routes against this registry.
    pub fn router(&self) -> Router {
        crate::routes::router(self.clone())
    }

    /// Bind `127.0.0.1:0`, start serving and start the keepalive timer.
    ///
    /// Idempotent: later calls return the address bound by the first.
    pub async fn start(&self) -> Result<SocketAddr, BridgeError> {
        let mut running = self.inner.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.addr);
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(BridgeError::Bind)?;
        let addr = listener.local_addr().map_err(BridgeError::Bind)?;
        let shutdown = CancellationToken::new();

        let app = self.router();
        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
            {
                warn!("Bridge server error: {e}");
            }
        });

        let keepalive_task = tokio::spawn(keepalive_loop(self.clone(), shutdown.clone()));

        info!("Bridge listening on http://{addr}");
        *running = Some(Running {
            addr,
            shutdown,
            server_task,
            keepalive_task,
        });
        Ok(addr)
    }

    /// Address bound by [`start`](Self::start), if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Stop the listener and keepalive timer and close every session.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().await.take();
        let ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.remove_session(&id).await;
        }
        if let Some(r) = running {
            r.shutdown.cancel();
            r.keepalive_task.abort();
            let abort = r.server_task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, r.server_task)
                .await
                .is_err()
            {
                warn!("Bridge server did not drain within {SHUTDOWN_GRACE:?}, aborting");
                abort.abort();
            }
            info!("Bridge stopped");
        }
    }

    /// Register a new session with fresh id and token.
    ///
    /// The server must be started so the returned URL carries a real port.
    pub async fn create_session(
        &self,
        handlers: Arc<dyn BridgeHandlers>,
    ) -> Result<SessionInfo, BridgeError> {
        let addr = self.local_addr().await.ok_or(BridgeError::NotStarted)?;
        let token = generate_token();
        let mut sessions = self.inner.sessions.write().await;
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(id.clone(), BridgeSession::new(token.clone(), handlers));
        drop(sessions);

        info!(session_id = %id, "Bridge session created");
        Ok(SessionInfo {
            base_url: format!("http://{addr}/bridge/{id}"),
            id,
            token,
        })
    }

    /// Close every subscriber of `session_id` and forget the session.
    ///
    /// Returns whether a session was removed; calling it again is a no-op.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.inner.sessions.write().await.remove(session_id);
        match removed {
            Some(mut session) => {
                session.close();
                info!(session_id, "Bridge session removed");
                true
            }
            None => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, BridgeSession::subscriber_count)
    }

    /// Check `token` for `session_id` and return the session's handlers.
    ///
    /// Unknown sessions and mismatched or missing tokens are the same error.
    pub async fn authorize(
        &self,
        session_id: &str,
        token: Option<&str>,
    ) -> Result<Arc<dyn BridgeHandlers>, BridgeError> {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(session_id) {
            Some(session) if token_matches(&session.token, token) => {
                Ok(Arc::clone(&session.handlers))
            }
            _ => Err(BridgeError::Unauthorized),
        }
    }

    /// Register a new SSE subscriber. The `connected` frame is already queued
    /// on the returned subscription.
    pub async fn subscribe(
        &self,
        session_id: &str,
        token: Option<&str>,
    ) -> Result<Subscription, BridgeError> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .filter(|s| token_matches(&s.token, token))
            .ok_or(BridgeError::Unauthorized)?;

        let subscriber_id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        // Fresh queue with a live receiver, so this cannot fail.
        let _ = tx.try_send(Frame::Connected {
            session_id: session_id.to_string(),
        });
        session.add_subscriber(subscriber_id, tx);
        debug!(
            session_id,
            subscriber_id,
            subscribers = session.subscriber_count(),
            "SSE subscriber attached"
        );
        drop(sessions);

        Ok(Subscription::new(
            session_id.to_string(),
            subscriber_id,
            rx,
            self.clone(),
        ))
    }

    pub(crate) async fn remove_subscriber(&self, session_id: &str, subscriber_id: u64) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            if session.remove_subscriber(subscriber_id) {
                debug!(session_id, subscriber_id, "SSE subscriber detached");
            }
        }
    }

    /// Fan `frame` out to every current subscriber of one session.
    ///
    /// Frames to a session with no subscribers (or no such session) are dropped.
    pub async fn broadcast(&self, session_id: &str, frame: &Frame) -> usize {
        let mut sessions = self.inner.sessions.write().await;
        sessions
            .get_mut(session_id)
            .map_or(0, |session| session.send_all(frame))
    }

    /// Broadcast a reply envelope.
    pub async fn reply(&self, session_id: &str, envelope: &ReplyEnvelope) -> usize {
        self.broadcast(session_id, &Frame::Message(envelope.to_value()))
            .await
    }

    /// Push an unsolicited `message` frame (e.g. chat output) to a session.
    pub async fn notify(&self, session_id: &str, payload: Value) -> usize {
        self.broadcast(session_id, &Frame::Message(payload)).await
    }

    /// Send one keepalive comment to every subscriber of every session,
    /// pruning subscribers whose stream is gone.
    pub async fn keepalive_tick(&self) {
        let mut sessions = self.inner.sessions.write().await;
        for session in sessions.values_mut() {
            session.send_all(&Frame::Ping);
        }
    }
}

async fn keepalive_loop(server: BridgeServer, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(server.config().keepalive_interval());
    // First tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => server.keepalive_tick().await,
        }
    }
}
