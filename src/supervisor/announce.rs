//! Recovering the backend's address from its unstructured stdout.
//!
//! The backend prints a line like `server listening on http://127.0.0.1:4096`
//! once it is ready. [`wait_for_announcement`] reads stdout in arbitrary
//! chunks, reassembles lines, and resolves on the first such line. Everything
//! after that is drained to the log so the pipe never fills. Stderr is
//! captured in the background by [`StderrCapture`] for error reports.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::process::{wait_exit, ExitInfo};
use crate::error::SupervisorError;
use crate::lines::LineBuffer;

/// Max stderr bytes kept for error reports; older output is discarded first.
const MAX_STDERR: usize = 64 * 1024;

/// How long to keep reading after exit/EOF to pick up trailing output.
const SETTLE: Duration = Duration::from_millis(500);

/// Address announced by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub port: u16,
    /// `scheme://host:port`, no trailing slash.
    pub base_url: String,
}

/// Recognise a "listening on <url>" line and pull the address out of it.
pub fn parse_listening_line(line: &str) -> Option<Announcement> {
    let lower = line.to_ascii_lowercase();
    let marker = lower.find("listening on")?;
    let rest = &line[marker..];
    let start = rest.find("http://").or_else(|| rest.find("https://"))?;
    let token = rest[start..]
        .split_whitespace()
        .next()?
        .trim_end_matches(['.', ',', ';', ')', '"', '\'']);

    let url = reqwest::Url::parse(token).ok()?;
    let host = url.host()?.to_string();
    let port = url.port_or_known_default()?;
    Some(Announcement {
        port,
        base_url: format!("{}://{host}:{port}", url.scheme()),
    })
}

/// Background reader that logs and keeps the tail of a child's stderr.
pub struct StderrCapture {
    buf: Arc<Mutex<String>>,
    task: JoinHandle<()>,
}

impl StderrCapture {
    pub fn spawn<R>(stderr: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "chatbridge::backend", "stderr: {line}");
                let mut buf = sink.lock().await;
                buf.push_str(&line);
                buf.push('\n');
                if buf.len() > MAX_STDERR {
                    let mut cut = buf.len() - MAX_STDERR;
                    while !buf.is_char_boundary(cut) {
                        cut += 1;
                    }
                    buf.drain(..cut);
                }
            }
        });
        Self { buf, task }
    }

    /// Give the reader a moment to reach EOF, then return what was captured.
    pub async fn finish(self, wait: Duration) -> String {
        let _ = tokio::time::timeout(wait, self.task).await;
        self.buf.lock().await.clone()
    }
}

enum Scan {
    Found(Announcement),
    Eof,
    Exited(ExitInfo),
}

/// Read `stdout` until the backend announces its address.
///
/// Fails with [`SupervisorError::ProcessExit`] if the process exits (or closes
/// stdout) first, and [`SupervisorError::ConnectionTimeout`] if nothing is
/// announced within `timeout`. Both carry the captured stderr.
pub async fn wait_for_announcement<R>(
    mut stdout: R,
    stderr: StderrCapture,
    exit: watch::Receiver<Option<ExitInfo>>,
    timeout: Duration,
) -> Result<Announcement, SupervisorError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = LineBuffer::new();
    let scan = tokio::time::timeout(timeout, scan(&mut stdout, &mut lines, exit.clone())).await;

    match scan {
        Ok(Scan::Found(announcement)) => {
            debug!("Backend announced {}", announcement.base_url);
            tokio::spawn(drain(stdout, lines));
            Ok(announcement)
        }
        Ok(Scan::Eof) => {
            if let Some(a) = lines.finish().as_deref().and_then(parse_listening_line) {
                return Ok(a);
            }
            let info = tokio::time::timeout(SETTLE, wait_exit(exit)).await.ok();
            Err(SupervisorError::ProcessExit {
                code: info.and_then(|i| i.code),
                stderr: stderr.finish(SETTLE).await,
            })
        }
        Ok(Scan::Exited(info)) => Err(SupervisorError::ProcessExit {
            code: info.code,
            stderr: stderr.finish(SETTLE).await,
        }),
        Err(_) => Err(SupervisorError::ConnectionTimeout {
            timeout_secs: timeout.as_secs(),
            stderr: stderr.finish(Duration::ZERO).await,
        }),
    }
}

async fn scan<R>(
    stdout: &mut R,
    lines: &mut LineBuffer,
    exit: watch::Receiver<Option<ExitInfo>>,
) -> Scan
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let exited = wait_exit(exit);
    tokio::pin!(exited);
    let info = loop {
        let step = tokio::select! {
            biased;
            read = stdout.read(&mut chunk) => Ok(read),
            info = &mut exited => Err(info),
        };
        let n = match step {
            Ok(Ok(0) | Err(_)) => return Scan::Eof,
            Ok(Ok(n)) => n,
            Err(info) => break info,
        };
        for line in lines.push(&chunk[..n]) {
            trace!(target: "chatbridge::backend", "stdout: {line}");
            if let Some(announcement) = parse_listening_line(&line) {
                return Scan::Found(announcement);
            }
        }
    };

    // Pick up anything printed just before exit.
    match tokio::time::timeout(SETTLE, read_to_match(stdout, lines)).await {
        Ok(Scan::Found(a)) => Scan::Found(a),
        _ => Scan::Exited(info),
    }
}

async fn read_to_match<R>(stdout: &mut R, lines: &mut LineBuffer) -> Scan
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => return Scan::Eof,
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    if let Some(announcement) = parse_listening_line(&line) {
                        return Scan::Found(announcement);
                    }
                }
            }
        }
    }
}

async fn drain<R>(mut stdout: R, mut lines: LineBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    trace!(target: "chatbridge::backend", "stdout: {line}");
                }
            }
        }
    }
}
