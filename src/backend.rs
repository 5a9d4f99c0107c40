//! REST client for the chat backend's session and prompt endpoints.
//!
//! Replies do not come back on these requests: `prompt` is accepted with
//! `204` and the text arrives on the event stream (see [`crate::relay`]).

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::BackendError;

pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    session_path: String,
    prompt_path: String,
}

impl BackendClient {
    pub fn new(base_url: &str, config: &BackendConfig) -> Self {
        let http = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_path: config.session_path.clone(),
            prompt_path: config.prompt_path.clone(),
        }
    }

    /// `POST /session`: returns the new session id.
    pub async fn create_session(&self, title: Option<&str>) -> Result<String, BackendError> {
        let url = crate::util::join_url(&self.base_url, &self.session_path);
        let body = match title {
            Some(title) => json!({ "title": title }),
            None => json!({}),
        };
        let resp = self.http.post(&url).json(&body).send().await?;
        let value = Self::handle_response(resp).await?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or(BackendError::Protocol("session id"))?;
        debug!("Created backend session {id}");
        Ok(id.to_string())
    }

    /// `POST /session/{id}/prompt_async` with a single text part.
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<(), BackendError> {
        let path = self.prompt_path.replace("{id}", session_id);
        let url = crate::util::join_url(&self.base_url, &path);
        let body = json!({ "parts": [{ "type": "text", "text": text }] });
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BackendError::Status {
                status,
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }

    async fn handle_response(resp: reqwest::Response) -> Result<Value, BackendError> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status { status, body });
        }
        serde_json::from_str(&body).map_err(|_| BackendError::Protocol("JSON body"))
    }
}
