//! Media sink seam between the receiver/signaling core and the transport
//!
//! The receiver pushes Annex-B video units and Opus chunks into a
//! [`MediaSink`]; the signaling hub asks it to answer SDP offers.

use crate::webrtc::WebRTCError;
use async_trait::async_trait;
use bytes::Bytes;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Send one video unit. `pts_micros` is the agent's presentation time.
    async fn send_video(&self, nal: Bytes, pts_micros: i64) -> Result<(), WebRTCError>;

    /// Send one audio chunk (Opus packet or wrapped identification header)
    async fn send_audio(&self, chunk: Bytes, pts_micros: i64) -> Result<(), WebRTCError>;

    /// Answer a viewer's offer
    async fn negotiate(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, WebRTCError>;
}
