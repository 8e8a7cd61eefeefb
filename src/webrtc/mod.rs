//! WebRTC side of the bridge
//!
//! This module provides:
//! - Peer connection setup (answering viewers, offering as a relay)
//! - The shared H264/Opus sample tracks fed by the receiver
//! - H264 RTP depacketization for the relay path

pub mod depacketizer;
pub mod media_track;
pub mod peer_connection;

pub use depacketizer::RtpDepacketizer;
pub use media_track::WebRtcMediaSink;
pub use peer_connection::PeerConnectionManager;

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// Media track error
    MediaError(String),
    /// Invalid state transition
    InvalidState(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
            WebRTCError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for WebRTCError {}
