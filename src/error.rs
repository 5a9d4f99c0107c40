//! Error types for the bridge, supervisor, relay and backend client.

use thiserror::Error;

/// Errors raised by [`crate::bridge::BridgeServer`] outside the HTTP layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind bridge listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("bridge server is not started")]
    NotStarted,

    /// Unknown session or token mismatch. The HTTP layer maps both to `401`.
    #[error("unauthorized")]
    Unauthorized,
}

/// Failure of an injected UI capability. Reported as `ok: false` in the reply envelope.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0} is not supported by this surface")]
    Unsupported(&'static str),

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked")]
    Panicked,
}

/// Which way a backend failure looked, judged from its stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrClass {
    PermissionDenied,
    PortInUse,
}

/// Errors raised while discovering, spawning or supervising the backend.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("backend binary not found: {0}")]
    BinaryNotFound(String),

    #[error("no bundled backend binary for {os}/{arch}")]
    UnsupportedPlatform {
        os: &'static str,
        arch: &'static str,
    },

    #[error("failed to spawn backend: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("backend did not announce a listening address within {timeout_secs}s\n{stderr}")]
    ConnectionTimeout { timeout_secs: u64, stderr: String },

    #[error("backend exited before announcing a listening address (code {code:?})\n{stderr}")]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("backend was denied access\n{stderr}")]
    PermissionDenied { stderr: String },

    #[error("backend port is already in use\n{stderr}")]
    PortInUse { stderr: String },

    #[error("backend launch cancelled by terminate")]
    Cancelled,
}

impl SupervisorError {
    /// Captured stderr attached to launch failures, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ConnectionTimeout { stderr, .. }
            | Self::ProcessExit { stderr, .. }
            | Self::PermissionDenied { stderr }
            | Self::PortInUse { stderr } => Some(stderr),
            _ => None,
        }
    }

    /// Re-tag a launch failure by what its stderr says, leaving other errors alone.
    pub fn classified(self) -> Self {
        let class = self.stderr().and_then(classify_stderr);
        match (class, self) {
            (Some(StderrClass::PermissionDenied), e) => Self::PermissionDenied {
                stderr: e.stderr().unwrap_or_default().to_string(),
            },
            (Some(StderrClass::PortInUse), e) => Self::PortInUse {
                stderr: e.stderr().unwrap_or_default().to_string(),
            },
            (None, e) => e,
        }
    }
}

/// Recognise permission and port-in-use failures in backend stderr.
pub fn classify_stderr(stderr: &str) -> Option<StderrClass> {
    let lower = stderr.to_ascii_lowercase();
    if ["eacces", "eperm", "permission denied", "access is denied", "operation not permitted"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return Some(StderrClass::PermissionDenied);
    }
    if ["eaddrinuse", "address already in use", "port is already in use", "address in use"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return Some(StderrClass::PortInUse);
    }
    None
}

/// Errors raised by the event relay when opening the backend stream.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("event stream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("event stream returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Errors raised by the backend REST client.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("backend response missing {0}")]
    Protocol(&'static str),
}

/// Errors raised while opening or driving a [`crate::surface::ChatSurface`].
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permission() {
        assert_eq!(
            classify_stderr("Error: EACCES: permission denied, open '/x'"),
            Some(StderrClass::PermissionDenied)
        );
        assert_eq!(
            classify_stderr("Access is denied."),
            Some(StderrClass::PermissionDenied)
        );
    }

    #[test]
    fn test_classify_port_in_use() {
        assert_eq!(
            classify_stderr("error: listen EADDRINUSE: address already in use 127.0.0.1:4096"),
            Some(StderrClass::PortInUse)
        );
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(classify_stderr("warning: config not found"), None);
    }

    #[test]
    fn test_classified_rewrites_exit() {
        let err = SupervisorError::ProcessExit {
            code: Some(1),
            stderr: "listen EADDRINUSE".to_string(),
        }
        .classified();
        assert!(matches!(err, SupervisorError::PortInUse { .. }));
        assert_eq!(err.stderr(), Some("listen EADDRINUSE"));
    }

    #[test]
    fn test_classified_keeps_unrelated() {
        let err = SupervisorError::BinaryNotFound("x".to_string()).classified();
        assert!(matches!(err, SupervisorError::BinaryNotFound(_)));
    }
}
