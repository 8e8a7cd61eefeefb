//! WebRTC PeerConnection management
//!
//! Handles the creation and SDP exchange of RTCPeerConnection instances for
//! both directions: answering a browser viewer, and offering as a relay.

use super::WebRTCError;
use crate::config::WebRTCConfig;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// PeerConnection factory
pub struct PeerConnectionManager {
    config: WebRTCConfig,
}

impl PeerConnectionManager {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the default codec set
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        // Create interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.config.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api.new_peer_connection(rtc_config).await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    /// Add a receive-only transceiver (relay side)
    pub async fn add_recv_only(
        peer_connection: &Arc<RTCPeerConnection>,
        kind: RTPCodecType,
    ) -> Result<(), WebRTCError> {
        peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add {} transceiver: {}", kind, e)))?;
        Ok(())
    }

    /// Set up ICE connection state callback
    pub fn setup_ice_state_callback(
        peer_connection: &Arc<RTCPeerConnection>,
        callback: impl Fn(RTCIceConnectionState) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        peer_connection.on_ice_connection_state_change(Box::new(move |state| {
            let callback = callback.clone();
            Box::pin(async move {
                callback(state);
            })
        }));
    }

    /// Create an SDP offer and wait for ICE gathering so the returned
    /// description carries every candidate
    pub async fn create_offer(
        peer_connection: &Arc<RTCPeerConnection>,
    ) -> Result<RTCSessionDescription, WebRTCError> {
        let offer = peer_connection.create_offer(None).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        let mut gather_complete = peer_connection.gathering_complete_promise().await;

        peer_connection.set_local_description(offer.clone()).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        let _ = gather_complete.recv().await;
        Ok(peer_connection.local_description().await.unwrap_or(offer))
    }

    /// Apply the remote answer
    pub async fn handle_answer(
        peer_connection: &Arc<RTCPeerConnection>,
        answer: RTCSessionDescription,
    ) -> Result<(), WebRTCError> {
        peer_connection.set_remote_description(answer).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    /// Handle an SDP offer and return the complete (non-trickle) answer
    pub async fn handle_offer(
        peer_connection: &Arc<RTCPeerConnection>,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, WebRTCError> {
        peer_connection.set_remote_description(offer).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = peer_connection.create_answer(None).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = peer_connection.gathering_complete_promise().await;

        peer_connection.set_local_description(answer.clone()).await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        let _ = gather_complete.recv().await;
        Ok(peer_connection.local_description().await.unwrap_or(answer))
    }

    /// Close a peer connection
    pub async fn close(peer_connection: &Arc<RTCPeerConnection>) -> Result<(), WebRTCError> {
        peer_connection.close().await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}
