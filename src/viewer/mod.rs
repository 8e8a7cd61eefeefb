//! Relay viewer
//!
//! Connects to a bridge as a viewer and re-emits the received video in the
//! capture agent's framed format.

pub mod client;
pub mod writer;

pub use client::ViewerClient;
pub use writer::FramedNalWriter;

use crate::webrtc::WebRTCError;
use std::error::Error;
use std::fmt;
use tokio_tungstenite::tungstenite;

#[derive(Debug)]
pub enum ViewerError {
    /// Signaling connection failed
    Signaling(tungstenite::Error),
    /// Peer connection setup failed
    WebRTC(WebRTCError),
    /// Unexpected or refused signaling exchange
    Protocol(String),
    /// The bridge refused the password
    AuthRejected,
}

impl fmt::Display for ViewerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewerError::Signaling(e) => write!(f, "Signaling error: {}", e),
            ViewerError::WebRTC(e) => write!(f, "{}", e),
            ViewerError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ViewerError::AuthRejected => write!(f, "Login rejected by bridge"),
        }
    }
}

impl Error for ViewerError {}

impl From<tungstenite::Error> for ViewerError {
    fn from(e: tungstenite::Error) -> Self {
        ViewerError::Signaling(e)
    }
}

impl From<WebRTCError> for ViewerError {
    fn from(e: WebRTCError) -> Self {
        ViewerError::WebRTC(e)
    }
}
