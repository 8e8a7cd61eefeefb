//! castbridge - screen-cast protocol bridge
//!
//! Accepts framed H264/Opus from a capture agent over TCP and republishes it
//! to browser viewers over WebRTC, with a password-protected WebSocket
//! signaling channel.

pub mod config;
pub mod media;
pub mod receiver;
pub mod signaling;
pub mod state;
pub mod viewer;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use media::MediaSink;
pub use receiver::{NalReframer, Receiver, ReceiverEvent};
pub use signaling::{ConnectionBroadcaster, ReplayGuard, SessionEvent, SignalingHub};
pub use state::{StreamEvent, StreamInfo, StreamState};
pub use viewer::{FramedNalWriter, ViewerClient};
pub use webrtc::{PeerConnectionManager, RtpDepacketizer, WebRtcMediaSink};
