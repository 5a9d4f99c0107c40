//! UI capabilities injected per session, and dispatch of decoded messages to them.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{info, warn};

use super::message::Message;
use crate::error::HandlerError;

/// Capabilities the owner of a UI surface provides to its bridge session.
///
/// `ui_get_state` and `ui_set_state` are optional; surfaces that keep no state
/// leave the defaults, which report [`HandlerError::Unsupported`].
#[async_trait]
pub trait BridgeHandlers: Send + Sync {
    async fn open_file(&self, path: &str) -> Result<(), HandlerError>;

    async fn open_url(&self, url: &str) -> Result<(), HandlerError>;

    async fn reload_path(&self, path: &str) -> Result<(), HandlerError>;

    async fn clipboard_write(&self, text: &str) -> Result<(), HandlerError>;

    async fn ui_get_state(&self) -> Result<Value, HandlerError> {
        Err(HandlerError::Unsupported("uiGetState"))
    }

    async fn ui_set_state(&self, _state: Value) -> Result<(), HandlerError> {
        Err(HandlerError::Unsupported("uiSetState"))
    }
}

/// Route one message to the matching capability.
///
/// A panicking handler is contained and reported as [`HandlerError::Panicked`]
/// so the caller still gets a reply envelope.
pub async fn dispatch(handlers: &dyn BridgeHandlers, message: Message) -> Result<Value, HandlerError> {
    let kind = message.kind();
    let fut = async move {
        match message {
            Message::OpenFile { path } => handlers.open_file(&path).await.map(|()| Value::Null),
            Message::OpenUrl { url } => handlers.open_url(&url).await.map(|()| Value::Null),
            Message::ReloadPath { path } => {
                handlers.reload_path(&path).await.map(|()| Value::Null)
            }
            Message::ClipboardWrite { text } => {
                handlers.clipboard_write(&text).await.map(|()| Value::Null)
            }
            Message::UiGetState {} => handlers.ui_get_state().await,
            Message::UiSetState { state } => {
                handlers.ui_set_state(state).await.map(|()| Value::Null)
            }
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!("{kind} handler panicked");
            Err(HandlerError::Panicked)
        }
    }
}

/// Handlers that only log what the UI asked for. Used by the CLI, where no
/// editor is attached.
#[derive(Debug, Default)]
pub struct LoggingHandlers {
    state: tokio::sync::Mutex<Option<Value>>,
}

#[async_trait]
impl BridgeHandlers for LoggingHandlers {
    async fn open_file(&self, path: &str) -> Result<(), HandlerError> {
        info!(path, "UI requested openFile");
        Ok(())
    }

    async fn open_url(&self, url: &str) -> Result<(), HandlerError> {
        info!(url, "UI requested openUrl");
        Ok(())
    }

    async fn reload_path(&self, path: &str) -> Result<(), HandlerError> {
        info!(path, "UI requested reloadPath");
        Ok(())
    }

    async fn clipboard_write(&self, text: &str) -> Result<(), HandlerError> {
        info!(bytes = text.len(), "UI requested clipboardWrite");
        Ok(())
    }

    async fn ui_get_state(&self) -> Result<Value, HandlerError> {
        Ok(self.state.lock().await.clone().unwrap_or(Value::Null))
    }

    async fn ui_set_state(&self, state: Value) -> Result<(), HandlerError> {
        *self.state.lock().await = Some(state);
        Ok(())
    }
}
