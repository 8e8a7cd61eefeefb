//! HTTP server for health checks and signaling
//!
//! Hosts the viewer-facing WebSocket endpoint and optional static files.

pub mod http_server;
pub use http_server::{run_http_server, AppState};
