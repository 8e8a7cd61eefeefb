//! WebSocket signaling
//!
//! This module provides:
//! - The JSON envelope codec
//! - Challenge-response login with anti-replay and per-IP lockout
//! - The connection registry used for `infoNotify` broadcasts
//! - The per-connection state machine ([`SignalingHub`])

pub mod auth;
pub mod broadcaster;
pub mod message;
pub mod session;
pub mod ttl_map;

pub use broadcaster::{ConnectionBroadcaster, Outbound, SessionHandle};
pub use message::{ClientMessage, ServerMessage};
pub use session::{Flow, Session, SignalingHub};
pub use ttl_map::ReplayGuard;

use std::error::Error;
use std::fmt;

/// Events pushed to the embedding layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Authenticated `control` payload (input injection command)
    Control(serde_json::Value),
    /// Authenticated `connectAdb` request with the target address
    ConnectAdb(String),
    /// A viewer attempted a login with this maxSize hint
    LoginInit { max_size: Option<u32> },
    /// A viewer peer connection changed ICE state
    PeerStateChanged { count: u64, connected: bool },
}

/// Signaling errors
#[derive(Debug)]
pub enum SignalingError {
    /// Incoming frame was not a known envelope
    Parse(serde_json::Error),
    /// Outgoing message could not be encoded
    Serialize(serde_json::Error),
    /// Connection writer is gone
    Closed,
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::Parse(e) => write!(f, "Invalid signaling message: {}", e),
            SignalingError::Serialize(e) => write!(f, "Failed to encode message: {}", e),
            SignalingError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl Error for SignalingError {}
