//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `CHATBRIDGE_BACKEND_BIN`,
//!    `CHATBRIDGE_BACKEND_ARGS`, `CHATBRIDGE_BACKEND_PORT`
//! 2. **Config file**: path via `--config <path>`, or `chatbridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [bridge]
//! keepalive_secs = 15
//! max_body_bytes = 1048576
//!
//! [backend]
//! binary_name = "opencode"
//! bundled_dir = "~/.local/share/chatbridge/bin"
//! extra_args = "--log-level 'DEBUG'"
//! default_port = 4096
//! alternate_ports = [4097, 4098]
//! health_path = "/global/health"
//! probe_timeout_ms = 1000
//! announce_timeout_secs = 180
//! terminate_grace_secs = 5
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::util::expand_tilde;

/// Environment variable that forces a specific backend binary, bypassing discovery.
pub const BINARY_OVERRIDE_ENV: &str = "CHATBRIDGE_BACKEND_BIN";
/// Environment variable carrying extra backend arguments (shell-like quoting).
pub const EXTRA_ARGS_ENV: &str = "CHATBRIDGE_BACKEND_ARGS";
/// Environment variable overriding the default backend port.
pub const DEFAULT_PORT_ENV: &str = "CHATBRIDGE_BACKEND_PORT";

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid {var} value {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bridge listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Seconds between keepalive comment frames on every SSE subscriber (default 15).
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Largest accepted `POST .../send` body in bytes (default 1 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Backend discovery, launch and HTTP contract settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Executable name looked up on `PATH` (default `opencode`).
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
    /// Directory holding extracted platform binaries (`<name>-<os>-<arch>`).
    #[serde(default)]
    pub bundled_dir: Option<String>,
    /// Explicit binary path. Set from `CHATBRIDGE_BACKEND_BIN`; wins over everything.
    #[serde(default)]
    pub binary_override: Option<String>,
    /// User-supplied extra arguments appended to the serve flags.
    #[serde(default)]
    pub extra_args: Option<String>,
    /// Port a shared backend is started on and probed first (default 4096).
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Well-known alternates probed after the default port.
    #[serde(default = "default_alternate_ports")]
    pub alternate_ports: Vec<u16>,
    /// Cheap endpoint used to decide whether a port hosts a live backend.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Per-port probe deadline in milliseconds (default 1000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// How long to wait for the "listening on" announcement (default 180 s).
    #[serde(default = "default_announce_timeout_secs")]
    pub announce_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on terminate (default 5 s).
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    /// Path appended to the base URL to form `ui_base` (default `/`).
    #[serde(default = "default_ui_path")]
    pub ui_path: String,
    /// Backend SSE endpoint consumed by the event relay (default `/event`).
    #[serde(default = "default_event_path")]
    pub event_path: String,
    /// Backend endpoint creating a chat session (default `/session`).
    #[serde(default = "default_session_path")]
    pub session_path: String,
    /// Backend prompt endpoint; `{id}` is replaced by the session id.
    #[serde(default = "default_prompt_path")]
    pub prompt_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_keepalive_secs() -> u64 {
    15
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_binary_name() -> String {
    "opencode".to_string()
}
fn default_port() -> u16 {
    4096
}
fn default_alternate_ports() -> Vec<u16> {
    vec![4097, 4098]
}
fn default_health_path() -> String {
    "/global/health".to_string()
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_announce_timeout_secs() -> u64 {
    180
}
fn default_terminate_grace_secs() -> u64 {
    5
}
fn default_ui_path() -> String {
    "/".to_string()
}
fn default_event_path() -> String {
    "/event".to_string()
}
fn default_session_path() -> String {
    "/session".to_string()
}
fn default_prompt_path() -> String {
    "/session/{id}/prompt_async".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            binary_name: default_binary_name(),
            bundled_dir: None,
            binary_override: None,
            extra_args: None,
            default_port: default_port(),
            alternate_ports: default_alternate_ports(),
            health_path: default_health_path(),
            probe_timeout_ms: default_probe_timeout_ms(),
            announce_timeout_secs: default_announce_timeout_secs(),
            terminate_grace_secs: default_terminate_grace_secs(),
            ui_path: default_ui_path(),
            event_path: default_event_path(),
            session_path: default_session_path(),
            prompt_path: default_prompt_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

impl BackendConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn announce_timeout(&self) -> Duration {
        Duration::from_secs(self.announce_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    /// Bundled binary directory with a leading `~` expanded.
    pub fn bundled_dir(&self) -> Option<PathBuf> {
        self.bundled_dir
            .as_deref()
            .map(|d| PathBuf::from(expand_tilde(d).into_owned()))
    }

    /// Extra args, treating a blank string as absent.
    pub fn extra_args(&self) -> Option<&str> {
        self.extra_args.as_deref().filter(|a| !a.trim().is_empty())
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks for
    /// `chatbridge.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("chatbridge.toml").exists() => Self::from_file("chatbridge.toml")?,
            None => Config::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply env var overrides using `lookup` (injected so tests avoid the process env).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(bin) = lookup(BINARY_OVERRIDE_ENV).filter(|b| !b.is_empty()) {
            self.backend.binary_override = Some(bin);
        }
        if let Some(args) = lookup(EXTRA_ARGS_ENV) {
            self.backend.extra_args = Some(args);
        }
        if let Some(port) = lookup(DEFAULT_PORT_ENV) {
            self.backend.default_port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: DEFAULT_PORT_ENV,
                value: port,
            })?;
        }
        Ok(())
    }
}
