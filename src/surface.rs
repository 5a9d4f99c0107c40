//! One UI surface wired end to end: a bridge session for the UI, a session on
//! the backend, and an event relay that pushes the backend's replies to the
//! UI as `chat.delta` / `chat.final` notifications.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::BackendClient;
use crate::bridge::handlers::BridgeHandlers;
use crate::bridge::{BridgeServer, SessionInfo};
use crate::config::BackendConfig;
use crate::error::SurfaceError;
use crate::relay::{EventRelay, RelayEvent};
use crate::supervisor::ConnectionInfo;

pub struct ChatSurface {
    bridge: BridgeServer,
    session: SessionInfo,
    backend: BackendClient,
    backend_session: String,
    relay: EventRelay,
    forward: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSurface {
    /// Register a bridge session and create the matching backend session.
    pub async fn open(
        bridge: &BridgeServer,
        handlers: Arc<dyn BridgeHandlers>,
        connection: &ConnectionInfo,
        config: &BackendConfig,
    ) -> Result<Self, SurfaceError> {
        let backend = BackendClient::new(&connection.base_url, config);
        let backend_session = backend.create_session(None).await?;
        let session = bridge.create_session(handlers).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let relay = EventRelay::new(
            &connection.base_url,
            &config.event_path,
            Some(backend_session.clone()),
            tx,
        );
        let forward = tokio::spawn(forward(bridge.clone(), session.id.clone(), rx));

        info!(
            session_id = %session.id,
            backend_session = %backend_session,
            "Chat surface opened"
        );
        Ok(Self {
            bridge: bridge.clone(),
            session,
            backend,
            backend_session,
            relay,
            forward: Mutex::new(Some(forward)),
        })
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn backend_session(&self) -> &str {
        &self.backend_session
    }

    /// Send a prompt, then make sure the reply stream is open.
    pub async fn send(&self, text: &str) -> Result<(), SurfaceError> {
        self.backend.prompt(&self.backend_session, text).await?;
        if self.relay.ensure_open().await? {
            debug!(session_id = %self.session.id, "Relay stream opened");
        }
        Ok(())
    }

    /// Close the relay stream, then the bridge session. Safe to call twice.
    pub async fn close(&self) {
        self.relay.close().await;
        if let Some(task) = self.forward.lock().await.take() {
            task.abort();
        }
        if self.bridge.remove_session(&self.session.id).await {
            info!(session_id = %self.session.id, "Chat surface closed");
        }
    }
}

async fn forward(
    bridge: BridgeServer,
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<RelayEvent>,
) {
    while let Some(event) = rx.recv().await {
        let payload = match event {
            RelayEvent::IncrementalText(text) => json!({ "type": "chat.delta", "text": text }),
            RelayEvent::FinalText(text) => json!({ "type": "chat.final", "text": text }),
        };
        bridge.notify(&session_id, payload).await;
    }
}
