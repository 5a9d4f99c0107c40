//! Relay of the backend's event stream to one UI surface.
//!
//! At most one upstream SSE connection is open per relay; asking to open it
//! again while it is still streaming is a no-op. Classified events go into an
//! unbounded channel owned by the caller.

pub mod classify;

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RelayError;
pub use classify::{classify, EventParser, RelayEvent};

pub struct EventRelay {
    http: reqwest::Client,
    url: String,
    /// Only forward events for this backend session (events that name no
    /// session always pass).
    session_filter: Option<String>,
    sink: mpsc::UnboundedSender<RelayEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventRelay {
    pub fn new(
        base_url: &str,
        event_path: &str,
        session_filter: Option<String>,
        sink: mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_default(),
            url: crate::util::join_url(base_url, event_path),
            session_filter,
            sink,
            task: Mutex::new(None),
        }
    }

    /// Open the upstream stream unless one is already running.
    ///
    /// Returns `true` if a new connection was opened, `false` if the existing
    /// one was reused.
    pub async fn ensure_open(&self) -> Result<bool, RelayError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(false);
        }

        debug!("Opening event stream {}", self.url);
        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::Status(response.status()));
        }

        *task = Some(tokio::spawn(pump(
            response,
            self.session_filter.clone(),
            self.sink.clone(),
        )));
        Ok(true)
    }

    pub async fn is_open(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Drop the upstream connection. Safe to call when nothing is open.
    pub async fn close(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            debug!("Closed event stream {}", self.url);
        }
    }
}

impl Drop for EventRelay {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn pump(
    response: reqwest::Response,
    session_filter: Option<String>,
    sink: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut stream = response.bytes_stream();
    let mut parser = EventParser::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Event stream error: {e}");
                break;
            }
        };
        for event in parser.push(&chunk) {
            if let (Some(wanted), Some(actual)) =
                (session_filter.as_deref(), classify::event_session_id(&event))
            {
                if wanted != actual {
                    continue;
                }
            }
            let Some(out) = classify(&event) else {
                continue;
            };
            if sink.send(out).is_err() {
                debug!("Relay sink closed, stopping event stream");
                return;
            }
        }
    }
    debug!("Event stream ended");
}
