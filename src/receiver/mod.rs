//! Capture-agent receiver
//!
//! Accepts the agent's TCP sockets (one per role: video, audio, control),
//! decodes the 12-byte frame headers and turns the elementary streams into
//! samples for the media sink:
//! - Frame header / stream preamble codec
//! - NAL unit splitting and SPS/PPS re-injection before key frames
//! - In-band Opus identification header chunks

pub mod frame;
pub mod nal;
pub mod opus_header;
pub mod reframer;
pub mod server;
pub mod sps;

pub use frame::{Frame, FrameHeader, StreamKind};
pub use nal::{NalType, NalUnit};
pub use reframer::NalReframer;
pub use server::{Receiver, ReceiverEvent};

use std::error::Error;
use std::fmt;

/// Receiver-side errors. All of them are scoped to one connection.
#[derive(Debug)]
pub enum ReceiverError {
    /// Socket read failed
    Io(std::io::Error),
    /// Peer closed the socket on a frame boundary
    Closed,
    /// EOF in the middle of a 12-byte frame header
    TruncatedHeader,
    /// EOF before the announced payload length was read
    TruncatedPayload { expected: usize },
    /// Stream preamble was cut short
    TruncatedPreamble,
    /// Announced payload exceeds the configured frame limit
    FrameTooLarge(usize),
}

impl fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverError::Io(e) => write!(f, "I/O error: {}", e),
            ReceiverError::Closed => write!(f, "Connection closed"),
            ReceiverError::TruncatedHeader => write!(f, "Truncated frame header"),
            ReceiverError::TruncatedPayload { expected } => {
                write!(f, "Truncated frame payload (expected {} bytes)", expected)
            }
            ReceiverError::TruncatedPreamble => write!(f, "Truncated stream preamble"),
            ReceiverError::FrameTooLarge(len) => write!(f, "Frame too large: {} bytes", len),
        }
    }
}

impl Error for ReceiverError {}

impl From<std::io::Error> for ReceiverError {
    fn from(e: std::io::Error) -> Self {
        ReceiverError::Io(e)
    }
}
