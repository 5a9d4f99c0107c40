#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! chatbridge library: the pieces that connect an embedded UI surface to a
//! locally running chat backend.
//!
//! - `bridge`: loopback HTTP + SSE bridge, session registry, keepalive
//! - `routes`: the bridge's HTTP handlers
//! - `supervisor`: discover, reuse, spawn and terminate the backend
//! - `relay`: backend event stream reassembly and classification
//! - `backend`: REST client for backend sessions and prompts
//! - `surface`: one UI surface wired to bridge, backend and relay
//! - `config`: configuration loading
//! - `lines`: chunk-to-line reassembly shared by supervisor and relay

pub mod auth;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod lines;
pub mod relay;
pub mod routes;
pub mod supervisor;
pub mod surface;
pub mod util;

// Re-export key types at crate root for convenience.
pub use bridge::handlers::{BridgeHandlers, LoggingHandlers};
pub use bridge::{BridgeServer, SessionInfo};
pub use config::Config;
pub use relay::{EventRelay, RelayEvent};
pub use supervisor::{ConnectionInfo, LaunchOptions, ProcessSupervisor};
pub use surface::ChatSurface;
