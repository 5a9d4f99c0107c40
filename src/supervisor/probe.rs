//! Short-deadline reachability checks against a backend health path.

use std::time::Duration;

use tracing::trace;

/// Asks "is there a live backend on this loopback port?".
#[derive(Clone)]
pub struct PortProber {
    http: reqwest::Client,
    health_path: String,
    timeout: Duration,
}

impl PortProber {
    pub fn new(health_path: &str, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_default(),
            health_path: health_path.to_string(),
            timeout,
        }
    }

    /// `true` if `GET http://127.0.0.1:<port><health_path>` answers 2xx in time.
    pub async fn probe(&self, port: u16) -> bool {
        let url = crate::util::join_url(&format!("http://127.0.0.1:{port}"), &self.health_path);
        match self.http.get(&url).timeout(self.timeout).send().await {
            Ok(resp) => {
                trace!(port, status = %resp.status(), "Probe answered");
                resp.status().is_success()
            }
            Err(e) => {
                trace!(port, "Probe failed: {e}");
                false
            }
        }
    }

    /// First port in `candidates` that answers, probed in order.
    pub async fn first_responding(&self, candidates: &[u16]) -> Option<u16> {
        for &port in candidates {
            if self.probe(port).await {
                return Some(port);
            }
        }
        None
    }
}

/// Priority-ordered, de-duplicated candidate list: last used port first,
/// then the default, then the alternates.
pub fn candidate_ports(last_used: Option<u16>, default: u16, alternates: &[u16]) -> Vec<u16> {
    let mut ports = Vec::with_capacity(alternates.len() + 2);
    for port in last_used
        .into_iter()
        .chain(std::iter::once(default))
        .chain(alternates.iter().copied())
    {
        if port != 0 && !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}
