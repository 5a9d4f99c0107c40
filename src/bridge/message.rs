//! Inbound messages and outbound reply envelopes.
//!
//! The wire shape is `{ "id"?: string, "type": string, "payload": object }`.
//! [`Inbound::decode`] turns that into a closed [`Message`] enum; any unknown
//! `type` or payload that does not fit its variant is rejected before a
//! handler sees it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::HandlerError;
use crate::util::now_ms;

/// Every message type the UI surface may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Message {
    OpenFile { path: String },
    OpenUrl { url: String },
    ReloadPath { path: String },
    ClipboardWrite { text: String },
    UiGetState {},
    UiSetState { state: Value },
}

impl Message {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpenFile { .. } => "openFile",
            Self::OpenUrl { .. } => "openUrl",
            Self::ReloadPath { .. } => "reloadPath",
            Self::ClipboardWrite { .. } => "clipboardWrite",
            Self::UiGetState {} => "uiGetState",
            Self::UiSetState { .. } => "uiSetState",
        }
    }
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// A decoded `POST .../send` body.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub id: Option<String>,
    pub message: Message,
}

impl Inbound {
    /// Decode and validate a request body.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawInbound = serde_json::from_slice(body)?;
        let payload = match raw.payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let message = serde_json::from_value(json!({ "type": raw.kind, "payload": payload }))?;
        Ok(Self {
            id: raw.id,
            message,
        })
    }
}

/// Result of one dispatch, broadcast to every subscriber of the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub reply_to: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl ReplyEnvelope {
    pub fn from_result(reply_to: Option<String>, result: Result<Value, HandlerError>) -> Self {
        let timestamp = now_ms();
        match result {
            Ok(payload) => Self {
                reply_to,
                ok: true,
                payload: (!payload.is_null()).then_some(payload),
                error: None,
                timestamp,
            },
            Err(e) => Self {
                reply_to,
                ok: false,
                payload: None,
                error: Some(e.to_string()),
                timestamp,
            },
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
