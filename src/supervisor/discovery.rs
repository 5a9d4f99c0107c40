//! Advisory fallback for reuse: find already-running backends by inspecting
//! the OS process table. Every failure here is swallowed; the caller simply
//! gets fewer candidate ports.

use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace};

/// Upper bound on each external inspection command.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Ports that running `<binary_name> serve` processes appear to listen on.
pub async fn discover_ports(binary_name: &str) -> Vec<u16> {
    #[cfg(unix)]
    {
        let Some(table) = run(&["ps", "-A", "-o", "pid=,args="]).await else {
            return Vec::new();
        };
        let mut ports = Vec::new();
        for (pid, args) in matching_processes(&table, binary_name) {
            let found = match port_from_args(&args) {
                Some(port) => vec![port],
                None => listening_ports(pid).await,
            };
            trace!(pid, ?found, "Discovered backend process");
            for port in found {
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
        debug!(?ports, "Process discovery finished");
        ports
    }
    #[cfg(not(unix))]
    {
        let _ = binary_name;
        Vec::new()
    }
}

#[cfg(unix)]
async fn listening_ports(pid: u32) -> Vec<u16> {
    let pid = pid.to_string();
    run(&["lsof", "-Pan", "-p", &pid, "-iTCP", "-sTCP:LISTEN"])
        .await
        .map(|out| parse_lsof_ports(&out))
        .unwrap_or_default()
}

async fn run(argv: &[&str]) -> Option<String> {
    let (program, args) = argv.split_first()?;
    let output = tokio::time::timeout(INSPECT_TIMEOUT, Command::new(program).args(args).output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        trace!(program, status = %output.status, "Inspection command failed");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `(pid, args)` for every `ps` row that runs `binary_name` with `serve`.
fn matching_processes(table: &str, binary_name: &str) -> Vec<(u32, String)> {
    table
        .lines()
        .filter_map(|row| {
            let row = row.trim_start();
            let (pid, args) = row.split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            let args = args.trim();
            let mut tokens = args.split_whitespace();
            let program = tokens.next()?;
            let is_backend = program.rsplit(['/', '\\']).next()?.starts_with(binary_name)
                || args.contains(&format!("/{binary_name} "));
            (is_backend && tokens.any(|t| t == "serve")).then(|| (pid, args.to_string()))
        })
        .collect()
}

/// Value of `--port N` or `--port=N`; `0` means "OS-assigned" and is ignored.
fn port_from_args(args: &str) -> Option<u16> {
    let mut tokens = args.split_whitespace();
    while let Some(token) = tokens.next() {
        let value = match token.strip_prefix("--port") {
            Some("") => tokens.next(),
            Some(rest) => rest.strip_prefix('='),
            None => None,
        };
        if let Some(port) = value.and_then(|v| v.parse::<u16>().ok()) {
            return (port != 0).then_some(port);
        }
    }
    None
}

/// Ports from `lsof` rows like `... TCP 127.0.0.1:4096 (LISTEN)`.
fn parse_lsof_ports(output: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for row in output.lines().filter(|r| r.contains("(LISTEN)")) {
        let port = row
            .split_whitespace()
            .find_map(|field| field.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()));
        if let Some(port) = port.filter(|p| !ports.contains(p)) {
            ports.push(port);
        }
    }
    ports
}
