#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # chatbridge
//!
//! Local bridge between an embedded chat UI and a chat backend process.
//!
//! ## Subcommands
//!
//! - `chatbridge serve` (default): start the bridge, get a backend (reusing
//!   a running one when possible), open a chat surface and print its session
//!   URL and token. Lines typed on stdin are sent as prompts.
//! - `chatbridge launch [--force-new]`: get a backend, print its connection
//!   as JSON, and keep it running until interrupted.
//! - `chatbridge probe`: report whether a backend answers on a known port.
//!
//! ## Bridge API
//!
//! | Method | Path                            | Description                        |
//! |--------|---------------------------------|------------------------------------|
//! | GET    | `/bridge/{id}/events?token=…`   | SSE: `connected`, `message`, pings |
//! | POST   | `/bridge/{id}/send?token=…`     | `{id?, type, payload}` → `204`     |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, graceful shutdown
//! config.rs        TOML + env-var configuration
//! bridge/          BridgeServer, sessions, messages, handler dispatch
//! routes/          GET events, POST send
//! supervisor/      probe, discovery, binary lookup, spawn, announcement
//! relay/           backend SSE reassembly and classification
//! backend.rs       backend REST client
//! surface.rs       ChatSurface (bridge session + backend session + relay)
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chatbridge::supervisor::probe::candidate_ports;
use chatbridge::{
    BridgeServer, ChatSurface, Config, LaunchOptions, LoggingHandlers, ProcessSupervisor,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Local bridge between an embedded chat UI and a chat backend process.
#[derive(Parser)]
#[command(name = "chatbridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge and a chat surface (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Working directory for a spawned backend.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Get a backend and print its connection info.
    Launch {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Working directory for a spawned backend.
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Spawn an independent backend instead of reusing the shared one.
        #[arg(long)]
        force_new: bool,
    },
    /// Check the known ports for a running backend.
    Probe {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve {
        config: None,
        workspace: None,
    });

    let config_path = match &command {
        Commands::Serve { config, .. }
        | Commands::Launch { config, .. }
        | Commands::Probe { config } => config.clone(),
    };
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatbridge: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match command {
        Commands::Serve { workspace, .. } => run_serve(config, workspace).await,
        Commands::Launch {
            workspace,
            force_new,
            ..
        } => run_launch(config, workspace, force_new).await,
        Commands::Probe { .. } => run_probe(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(config: Config, workspace: Option<PathBuf>) -> Result<(), BoxError> {
    info!("chatbridge v{} starting", env!("CARGO_PKG_VERSION"));

    let bridge = BridgeServer::new(config.bridge.clone());
    let addr = bridge.start().await?;

    let supervisor = ProcessSupervisor::new(config.backend.clone());
    let launch = match supervisor
        .launch(workspace.as_deref(), LaunchOptions::default())
        .await
    {
        Ok(launch) => launch,
        Err(e) => {
            bridge.stop().await;
            return Err(e.into());
        }
    };
    info!(
        "Backend at {} ({})",
        launch.connection.base_url,
        if launch.connection.reused { "reused" } else { "spawned" }
    );

    let surface = match ChatSurface::open(
        &bridge,
        Arc::new(LoggingHandlers::default()),
        &launch.connection,
        &config.backend,
    )
    .await
    {
        Ok(surface) => surface,
        Err(e) => {
            supervisor.terminate().await;
            bridge.stop().await;
            return Err(e.into());
        }
    };

    let session = surface.session();
    info!("Bridge ready on {addr}");
    println!("{}", serde_json::to_string(session)?);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = surface.send(line.trim()).await {
                        warn!("Prompt failed: {e}");
                    }
                }
                // stdin closed; keep serving until signalled.
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }

    info!("Shutting down...");
    surface.close().await;
    supervisor.terminate().await;
    bridge.stop().await;
    info!("Goodbye");
    Ok(())
}

async fn run_launch(
    config: Config,
    workspace: Option<PathBuf>,
    force_new: bool,
) -> Result<(), BoxError> {
    let supervisor = ProcessSupervisor::new(config.backend);
    let launch = supervisor
        .launch(workspace.as_deref(), LaunchOptions { force_new })
        .await?;
    println!("{}", serde_json::to_string(&launch.connection)?);

    if launch.connection.reused {
        return Ok(());
    }

    info!("Backend running; press Ctrl-C to stop");
    shutdown_signal().await;
    match launch.process {
        Some(process) => {
            process
                .terminate(supervisor.config().terminate_grace())
                .await;
        }
        None => supervisor.terminate().await,
    }
    Ok(())
}

async fn run_probe(config: Config) -> Result<(), BoxError> {
    let supervisor = ProcessSupervisor::new(config.backend);
    let backend = supervisor.config();
    let candidates = candidate_ports(None, backend.default_port, &backend.alternate_ports);
    match supervisor.prober().first_responding(&candidates).await {
        Some(port) => {
            println!("{}", serde_json::json!({ "port": port, "responding": true }));
            Ok(())
        }
        None => Err(format!("no backend answering on ports {candidates:?}").into()),
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
