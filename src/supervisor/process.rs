//! Backend child process handle.
//!
//! The [`tokio::process::Child`] itself lives in a monitor task, so the handle can be watched
//! for exit and terminated from anywhere without holding `&mut Child`.
//! Dropping the handle kills the process, matching `kill_on_drop(true)`.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How a backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, or `None` if killed by a signal or the wait failed.
    pub code: Option<i32>,
    pub success: bool,
}

/// A spawned backend process.
#[derive(Debug)]
pub struct BackendProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
}

impl BackendProcess {
    /// Spawn `program` with piped stdout/stderr and hand back the pipes.
    pub fn spawn<I, S>(
        program: &Path,
        args: I,
        working_dir: Option<&Path>,
    ) -> std::io::Result<(Self, ChildStdout, ChildStderr)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir.filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("failed to take stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("failed to take stderr pipe"))?;

        let pid = child.id();
        info!("Spawned backend {} (pid {pid:?})", program.display());

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                // Kill request, or every handle was dropped.
                _ = kill_rx.recv() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!("start_kill failed: {e}");
                    }
                    child.wait().await
                }
            };
            let info = match status {
                Ok(s) => ExitInfo {
                    code: s.code(),
                    success: s.success(),
                },
                Err(e) => {
                    warn!("Backend wait error: {e}");
                    ExitInfo {
                        code: None,
                        success: false,
                    }
                }
            };
            debug!("Backend pid {pid:?} exited: {info:?}");
            let _ = exit_tx.send(Some(info));
        });

        Ok((
            Self {
                pid,
                exit_rx,
                kill_tx,
            },
            stdout,
            stderr,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit info if the process has already ended.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// A receiver that flips to `Some` when the process exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitInfo {
        wait_exit(self.exit_rx.clone()).await
    }

    /// Forcefully kill and wait.
    pub async fn kill(&self) -> ExitInfo {
        let _ = self.kill_tx.try_send(());
        self.wait().await
    }

    /// Ask the process to stop (SIGTERM), then SIGKILL after `grace`.
    ///
    /// Returns immediately if the process has already exited.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        if let Some(info) = self.exit_info() {
            return info;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                #[allow(clippy::cast_possible_wrap)]
                let raw_pid = pid as i32;
                if let Err(e) = kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
                    debug!("SIGTERM to pid {pid} failed: {e}");
                }
                if let Ok(info) = tokio::time::timeout(grace, self.wait()).await {
                    return info;
                }
                warn!("Backend pid {pid} still alive after {grace:?}, killing");
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.kill().await
    }
}

/// Resolve once `rx` reports an exit. A closed channel (monitor gone) counts
/// as exited with unknown status.
pub async fn wait_exit(mut rx: watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match rx.wait_for(Option::is_some).await {
        Ok(info) => (*info).unwrap_or(ExitInfo {
            code: None,
            success: false,
        }),
        Err(_) => ExitInfo {
            code: None,
            success: false,
        },
    }
}
