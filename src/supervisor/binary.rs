//! Locating the backend binary and building its argument vector.
//!
//! Resolution precedence:
//!
//! 1. explicit override (`CHATBRIDGE_BACKEND_BIN`, via [`BackendConfig::binary_override`])
//! 2. bundled binary in `bundled_dir`, named for the current OS/arch
//! 3. `PATH`, then common install locations under `$HOME` and `/usr/local`

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::BackendConfig;
use crate::error::SupervisorError;

/// Flags every launch carries, ahead of the port and any user arguments.
pub const SERVE_ARGS: &[&str] = &["serve", "--hostname", "127.0.0.1", "--cors", "*"];

/// Find the backend executable.
pub fn resolve_binary(config: &BackendConfig) -> Result<PathBuf, SupervisorError> {
    resolve_for(config, std::env::consts::OS, std::env::consts::ARCH)
}

fn resolve_for(
    config: &BackendConfig,
    os: &'static str,
    arch: &'static str,
) -> Result<PathBuf, SupervisorError> {
    if let Some(path) = config.binary_override.as_deref() {
        debug!("Using backend override {path}");
        return Ok(PathBuf::from(path));
    }

    if let Some(dir) = config.bundled_dir() {
        match bundled_name_for(&config.binary_name, os, arch) {
            Ok(name) => {
                let bundled = dir.join(name);
                if bundled.is_file() {
                    return Ok(bundled);
                }
                debug!("No bundled backend at {}", bundled.display());
            }
            Err(e) => debug!("Skipping bundled backend: {e}"),
        }
    }

    if let Ok(path) = which::which(&config.binary_name) {
        return Ok(path);
    }

    for path in common_locations(&config.binary_name) {
        if path.is_file() {
            return Ok(path);
        }
    }

    Err(SupervisorError::BinaryNotFound(format!(
        "`{name}` was not found on PATH or in the usual install locations. \
         Install it, or point {env} at an existing binary.",
        name = config.binary_name,
        env = crate::config::BINARY_OVERRIDE_ENV,
    )))
}

/// File name of the bundled binary for this OS/arch, e.g. `opencode-linux-x64`.
pub fn bundled_binary_name(base: &str) -> Result<String, SupervisorError> {
    bundled_name_for(base, std::env::consts::OS, std::env::consts::ARCH)
}

fn bundled_name_for(
    base: &str,
    os: &'static str,
    arch: &'static str,
) -> Result<String, SupervisorError> {
    let os = match os {
        "linux" => "linux",
        "macos" => "darwin",
        "windows" => "windows",
        other => {
            return Err(SupervisorError::UnsupportedPlatform { os: other, arch })
        }
    };
    let arch = match arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => {
            return Err(SupervisorError::UnsupportedPlatform { os, arch: other })
        }
    };
    let ext = if os == "windows" { ".exe" } else { "" };
    Ok(format!("{base}-{os}-{arch}{ext}"))
}

fn common_locations(name: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(format!(".{name}/bin/{name}")));
        paths.push(home.join(".local/bin").join(name));
        paths.push(home.join(".bun/bin").join(name));
        paths.push(home.join(".npm-global/bin").join(name));
    }
    paths.push(Path::new("/usr/local/bin").join(name));
    paths.push(Path::new("/opt/homebrew/bin").join(name));
    paths
}

/// Full argument vector: serve flags, the port, then user extras.
pub fn build_args(port: u16, extra: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = SERVE_ARGS.iter().map(ToString::to_string).collect();
    args.push("--port".to_string());
    args.push(port.to_string());
    if let Some(extra) = extra {
        args.extend(split_args(extra));
    }
    args
}

/// Shell-like tokenisation: whitespace separates tokens, `"…"` and `'…'`
/// group (quotes are removed and may abut bare text). No escapes, no
/// expansion. An unterminated quote runs to the end of the input.
pub fn split_args(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
