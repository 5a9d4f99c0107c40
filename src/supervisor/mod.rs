//! Backend process supervisor.
//!
//! [`ProcessSupervisor::launch`] either reuses a backend that is already
//! answering on a known port, or spawns one and waits for it to announce its
//! address. Ordinary launches share a single cached process ("shared
//! connection"); forced launches get an independent process that the caller
//! owns and that never touches the shared cache.
//!
//! Shared launches are serialised on a dedicated launch lock, so a relaunch
//! always terminates the previous process before the replacement is spawned.
//! A caller that queued behind a launch which succeeded gets that launch's
//! connection instead of starting another one. The state lock is only held to
//! read or swap the cached handle, so [`ProcessSupervisor::terminate`] never
//! waits on an announcement; it cancels an in-flight spawn instead.

pub mod announce;
pub mod binary;
pub mod discovery;
pub mod probe;
pub mod process;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::SupervisorError;
use announce::{wait_for_announcement, Announcement, StderrCapture};
use binary::{build_args, resolve_binary};
use probe::{candidate_ports, PortProber};
use process::{wait_exit, BackendProcess};

/// Where a backend can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub port: u16,
    /// `http://127.0.0.1:<port>`, no trailing slash.
    pub base_url: String,
    /// Base URL of the backend's web UI.
    pub ui_base: String,
    /// `true` if an already-running backend was found instead of spawning one.
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    /// Spawn an independent backend, bypassing the shared connection.
    pub force_new: bool,
}

/// Result of [`ProcessSupervisor::launch`].
#[derive(Debug)]
pub struct Launch {
    pub connection: ConnectionInfo,
    /// The forced process, owned by the caller. Always `None` for shared
    /// launches; the supervisor keeps that process itself.
    pub process: Option<BackendProcess>,
}

#[derive(Default)]
struct Shared {
    process: Option<BackendProcess>,
    connection: Option<ConnectionInfo>,
    last_port: Option<u16>,
    /// Bumped whenever `process` is replaced or cleared, so a stale exit
    /// watcher can tell it no longer owns the slot.
    generation: u64,
    /// Shared launches that completed successfully.
    launches: u64,
    /// Calls to `terminate`; a launch that sees this move discards its spawn.
    terminations: u64,
}

struct Inner {
    config: BackendConfig,
    prober: PortProber,
    shared: Mutex<Shared>,
    launching: Mutex<()>,
    terminated: Notify,
}

/// Discovers, reuses, spawns and terminates backend processes.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: BackendConfig) -> Self {
        let prober = PortProber::new(&config.health_path, config.probe_timeout());
        Self {
            inner: Arc::new(Inner {
                config,
                prober,
                shared: Mutex::new(Shared::default()),
                launching: Mutex::new(()),
                terminated: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    pub fn prober(&self) -> &PortProber {
        &self.inner.prober
    }

    /// Get a backend connection.
    ///
    /// `workspace` becomes the working directory of a spawned backend when it
    /// names an existing directory.
    pub async fn launch(
        &self,
        workspace: Option<&Path>,
        options: LaunchOptions,
    ) -> Result<Launch, SupervisorError> {
        if options.force_new {
            return self.launch_forced(workspace).await;
        }

        let seen = self.inner.shared.lock().await.launches;
        let _launching = self.inner.launching.lock().await;

        let (last_port, terminations) = {
            let shared = self.inner.shared.lock().await;
            if shared.launches != seen {
                if let Some(connection) = shared.connection.clone() {
                    debug!("Joining the launch that completed while waiting");
                    return Ok(Launch {
                        connection,
                        process: None,
                    });
                }
            }
            (shared.last_port, shared.terminations)
        };
        // Registered now so a `terminate` from here on cancels the spawn below.
        let terminated = self.inner.terminated.notified();
        tokio::pin!(terminated);

        if let Some(connection) = self.find_running(last_port).await {
            info!("Reusing backend on port {}", connection.port);
            let mut shared = self.inner.shared.lock().await;
            shared.last_port = Some(connection.port);
            shared.connection = Some(connection.clone());
            shared.launches += 1;
            return Ok(Launch {
                connection,
                process: None,
            });
        }

        let prior = {
            let mut shared = self.inner.shared.lock().await;
            shared.connection = None;
            let prior = shared.process.take();
            if prior.is_some() {
                shared.generation += 1;
            }
            prior
        };
        if let Some(prior) = prior {
            info!("Terminating previous backend (pid {:?})", prior.pid());
            prior.terminate(self.inner.config.terminate_grace()).await;
        }

        let (process, announcement) = tokio::select! {
            result = self.spawn_backend(workspace, self.inner.config.default_port) => result?,
            () = &mut terminated => return Err(SupervisorError::Cancelled),
        };

        let mut shared = self.inner.shared.lock().await;
        if shared.terminations != terminations {
            drop(shared);
            process.kill().await;
            return Err(SupervisorError::Cancelled);
        }

        let connection = self.connection_for(&announcement, false);
        info!(
            "Backend ready at {} (pid {:?})",
            connection.base_url,
            process.pid()
        );
        shared.generation += 1;
        self.watch_exit(&process, shared.generation);
        shared.process = Some(process);
        shared.connection = Some(connection.clone());
        shared.last_port = Some(connection.port);
        shared.launches += 1;

        Ok(Launch {
            connection,
            process: None,
        })
    }

    async fn launch_forced(&self, workspace: Option<&Path>) -> Result<Launch, SupervisorError> {
        let port = free_port().await?;
        let (process, announcement) = self.spawn_backend(workspace, port).await?;
        let connection = self.connection_for(&announcement, false);
        info!(
            "Forced backend ready at {} (pid {:?})",
            connection.base_url,
            process.pid()
        );
        Ok(Launch {
            connection,
            process: Some(process),
        })
    }

    /// Probe the candidate ports, then fall back to process discovery.
    async fn find_running(&self, last_port: Option<u16>) -> Option<ConnectionInfo> {
        let config = &self.inner.config;
        let candidates = candidate_ports(last_port, config.default_port, &config.alternate_ports);
        debug!(?candidates, "Probing for a running backend");
        if let Some(port) = self.inner.prober.first_responding(&candidates).await {
            return Some(self.reused_connection(port));
        }

        let discovered: Vec<u16> = discovery::discover_ports(&config.binary_name)
            .await
            .into_iter()
            .filter(|p| !candidates.contains(p))
            .collect();
        if discovered.is_empty() {
            return None;
        }
        let port = self.inner.prober.first_responding(&discovered).await?;
        Some(self.reused_connection(port))
    }

    /// Resolve, spawn and wait for the announcement, retrying once without
    /// the user's extra arguments if they were set.
    async fn spawn_backend(
        &self,
        workspace: Option<&Path>,
        port: u16,
    ) -> Result<(BackendProcess, Announcement), SupervisorError> {
        let binary = resolve_binary(&self.inner.config)?;
        let extra = self.inner.config.extra_args();

        let first = self.try_spawn(&binary, workspace, port, extra).await;
        let result = match (first, extra) {
            (Err(e), Some(extra)) => {
                warn!("Backend failed with extra args `{extra}`, retrying with defaults: {e}");
                self.try_spawn(&binary, workspace, port, None).await
            }
            (result, _) => result,
        };
        result.map_err(SupervisorError::classified)
    }

    async fn try_spawn(
        &self,
        binary: &Path,
        workspace: Option<&Path>,
        port: u16,
        extra: Option<&str>,
    ) -> Result<(BackendProcess, Announcement), SupervisorError> {
        let args = build_args(port, extra);
        debug!("Spawning {} {}", binary.display(), args.join(" "));
        let (process, stdout, stderr) = BackendProcess::spawn(binary, &args, workspace)?;
        let stderr = StderrCapture::spawn(stderr);

        match wait_for_announcement(
            stdout,
            stderr,
            process.exit_watch(),
            self.inner.config.announce_timeout(),
        )
        .await
        {
            Ok(announcement) => Ok((process, announcement)),
            Err(e) => {
                process.kill().await;
                Err(e)
            }
        }
    }

    /// Clear the shared slot when its process exits on its own.
    fn watch_exit(&self, process: &BackendProcess, generation: u64) {
        let exit = process.exit_watch();
        let pid = process.pid();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let info = wait_exit(exit).await;
            let mut shared = inner.shared.lock().await;
            if shared.generation != generation {
                return;
            }
            if info.success {
                info!("Backend (pid {pid:?}) exited");
            } else {
                warn!("Backend (pid {pid:?}) exited unexpectedly (code {:?})", info.code);
            }
            shared.process = None;
            shared.connection = None;
            shared.generation += 1;
        });
    }

    /// Stop the shared backend, if any, and cancel a shared launch that is
    /// still waiting for its announcement. Safe to call repeatedly.
    pub async fn terminate(&self) {
        let mut shared = self.inner.shared.lock().await;
        shared.connection = None;
        shared.terminations += 1;
        self.inner.terminated.notify_waiters();
        let Some(process) = shared.process.take() else {
            return;
        };
        shared.generation += 1;
        drop(shared);

        let info = process.terminate(self.inner.config.terminate_grace()).await;
        info!("Backend (pid {:?}) terminated: {info:?}", process.pid());
    }

    /// The cached shared connection, if one is live.
    pub async fn shared_connection(&self) -> Option<ConnectionInfo> {
        self.inner.shared.lock().await.connection.clone()
    }

    /// Port of the last successful shared launch or reuse.
    pub async fn last_port(&self) -> Option<u16> {
        self.inner.shared.lock().await.last_port
    }

    /// Whether the supervisor currently owns a running shared process.
    pub async fn has_process(&self) -> bool {
        self.inner.shared.lock().await.process.is_some()
    }

    fn reused_connection(&self, port: u16) -> ConnectionInfo {
        let announcement = Announcement {
            port,
            base_url: format!("http://127.0.0.1:{port}"),
        };
        self.connection_for(&announcement, true)
    }

    fn connection_for(&self, announcement: &Announcement, reused: bool) -> ConnectionInfo {
        ConnectionInfo {
            port: announcement.port,
            base_url: announcement.base_url.clone(),
            ui_base: crate::util::join_url(&announcement.base_url, &self.inner.config.ui_path),
            reused,
        }
    }
}

/// Ask the OS for a free loopback port for a forced backend.
async fn free_port() -> Result<u16, SupervisorError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}
