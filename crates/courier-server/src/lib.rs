//! # Courier Server
//!
//! WebSocket front end for the Courier delivery core: it authenticates
//! connections from upstream identity headers, feeds them into the
//! connection registry and forwards client traffic through the
//! cross-process bridge.

pub mod config;
pub mod handlers;
pub mod state;

pub use config::Config;
pub use handlers::{build_app, run_server, serve};
pub use state::AppState;
