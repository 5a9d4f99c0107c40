//! Turning raw backend SSE lines into a small outbound vocabulary.
//!
//! Upstream events are JSON objects shaped `{type, properties}` (or with the
//! fields inline). Only text matters downstream: either a complete reply
//! ([`RelayEvent::FinalText`]) or a piece of one ([`RelayEvent::IncrementalText`]).

use serde_json::Value;
use tracing::trace;

use crate::lines::LineBuffer;

/// Normalised event forwarded to the UI surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    FinalText(String),
    IncrementalText(String),
}

const FINAL_TYPES: &[&str] = &[
    "message.completed",
    "message.complete",
    "response.completed",
    "response",
];

const CHUNK_TYPES: &[&str] = &["message.chunk", "chunk", "stream.chunk", "response.delta"];

const PART_UPDATED: &str = "message.part.updated";

/// Updates that carry no text and are dropped without comment.
const METADATA_TYPES: &[&str] = &[
    "message.updated",
    "message.removed",
    "message.part.removed",
    "session.updated",
    "session.status",
    "session.idle",
    "session.diff",
    "server.connected",
];

/// Reassembles an SSE byte stream into parsed `data:` payloads.
#[derive(Debug, Default)]
pub struct EventParser {
    lines: LineBuffer,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every JSON payload it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| parse_data_line(line))
            .collect()
    }
}

/// JSON payload of a `data:` line. Other SSE fields, heartbeats (empty or
/// `{}`) and unparsable payloads yield `None`.
pub fn parse_data_line(line: &str) -> Option<Value> {
    let data = line.trim_end_matches('\r').strip_prefix("data:")?.trim();
    if data.is_empty() || data == "{}" {
        return None;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(map)) if map.is_empty() => None,
        Ok(value) => Some(value),
        Err(e) => {
            trace!("Skipping unparsable event data: {e}");
            None
        }
    }
}

/// Classify one upstream event.
pub fn classify(event: &Value) -> Option<RelayEvent> {
    let kind = event.get("type").and_then(Value::as_str)?;
    let props = event.get("properties").unwrap_or(event);

    if FINAL_TYPES.contains(&kind) {
        return text_field(props)
            .or_else(|| text_field(event))
            .map(RelayEvent::FinalText);
    }
    if CHUNK_TYPES.contains(&kind) {
        return text_field(props)
            .or_else(|| text_field(event))
            .map(RelayEvent::IncrementalText);
    }
    if kind == PART_UPDATED {
        return part_text(props).map(RelayEvent::IncrementalText);
    }
    if !METADATA_TYPES.contains(&kind) {
        trace!(kind, "Ignoring unrecognised event");
    }
    None
}

/// Text of a part update: delta string, then `delta.text`, then `part.text`,
/// then `part` itself when it is a string.
fn part_text(props: &Value) -> Option<String> {
    let delta = props.get("delta");
    let part = props.get("part");
    delta
        .and_then(Value::as_str)
        .or_else(|| delta.and_then(|d| d.get("text")).and_then(Value::as_str))
        .or_else(|| part.and_then(|p| p.get("text")).and_then(Value::as_str))
        .or_else(|| part.and_then(Value::as_str))
        .map(ToString::to_string)
}

fn text_field(value: &Value) -> Option<String> {
    ["text", "content", "delta"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(ToString::to_string)
}

/// Backend session an event belongs to, if it says.
pub fn event_session_id(event: &Value) -> Option<&str> {
    let props = event.get("properties").unwrap_or(event);
    [props.get("sessionID"), props.get("part").and_then(|p| p.get("sessionID"))]
        .into_iter()
        .flatten()
        .chain(props.get("info").and_then(|i| i.get("sessionID")))
        .find_map(Value::as_str)
}
