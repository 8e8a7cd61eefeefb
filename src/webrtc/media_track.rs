//! Shared WebRTC sample tracks
//!
//! One H264 track and one Opus track are created at startup and attached to
//! every viewer's peer connection, so a sample written once reaches all
//! connected viewers.

use super::peer_connection::PeerConnectionManager;
use super::WebRTCError;
use crate::media::MediaSink;
use crate::receiver::nal;
use crate::signaling::SessionEvent;
use crate::state::StreamState;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::media::Sample;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Duration assumed for the first sample of a stream (1/40 s)
const FIRST_SAMPLE_DURATION: Duration = Duration::from_millis(25);

/// Turns successive presentation timestamps into sample durations
#[derive(Debug, Default)]
pub struct SampleClock {
    last_pts: Option<i64>,
}

impl SampleClock {
    pub fn next_duration(&mut self, pts_micros: i64) -> Duration {
        let duration = match self.last_pts {
            None => FIRST_SAMPLE_DURATION,
            Some(last) => Duration::from_micros(pts_micros.saturating_sub(last).max(0) as u64),
        };
        self.last_pts = Some(pts_micros);
        duration
    }
}

fn feedback(typ: &str, parameter: &str) -> RTCPFeedback {
    RTCPFeedback {
        typ: typ.to_string(),
        parameter: parameter.to_string(),
    }
}

/// [`MediaSink`] backed by webrtc static sample tracks
pub struct WebRtcMediaSink {
    manager: PeerConnectionManager,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Option<Arc<TrackLocalStaticSample>>,
    video_clock: Mutex<SampleClock>,
    audio_clock: Mutex<SampleClock>,
    peers: Arc<RwLock<HashMap<Uuid, Arc<RTCPeerConnection>>>>,
    state: StreamState,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl WebRtcMediaSink {
    pub fn new(
        manager: PeerConnectionManager,
        with_audio: bool,
        state: StreamState,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string(),
                rtcp_feedback: vec![
                    feedback("goog-remb", ""),
                    feedback("ccm", "fir"),
                    feedback("nack", ""),
                    feedback("nack", "pli"),
                ],
            },
            "screens".to_string(),
            "screens".to_string(),
        ));

        let audio_track = with_audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=0".to_string(),
                    rtcp_feedback: vec![feedback("nack", ""), feedback("transport-cc", "")],
                },
                "audio".to_string(),
                "screens".to_string(),
            ))
        });

        Self {
            manager,
            video_track,
            audio_track,
            video_clock: Mutex::new(SampleClock::default()),
            audio_clock: Mutex::new(SampleClock::default()),
            peers: Arc::new(RwLock::new(HashMap::new())),
            state,
            events,
        }
    }

    /// Number of peer connections currently held (connected or negotiating)
    pub fn peer_connections(&self) -> usize {
        self.peers.read().len()
    }

    fn watch_ice_state(&self, id: Uuid, pc: &Arc<RTCPeerConnection>) {
        let connected = Arc::new(AtomicBool::new(false));
        let peers = self.peers.clone();
        let state = self.state.clone();
        let events = self.events.clone();

        PeerConnectionManager::setup_ice_state_callback(pc, move |ice_state| {
            debug!("Peer {} ICE state: {}", id, ice_state);
            match ice_state {
                RTCIceConnectionState::Connected => {
                    if !connected.swap(true, Ordering::SeqCst) {
                        let count = state.peer_connected();
                        info!("Viewer peer {} connected ({} active)", id, count);
                        let _ = events.send(SessionEvent::PeerStateChanged { count, connected: true });
                    }
                }
                RTCIceConnectionState::Disconnected
                | RTCIceConnectionState::Failed
                | RTCIceConnectionState::Closed => {
                    if connected.swap(false, Ordering::SeqCst) {
                        let count = state.peer_disconnected();
                        info!("Viewer peer {} disconnected ({} active)", id, count);
                        let _ = events.send(SessionEvent::PeerStateChanged { count, connected: false });
                    }
                    if let Some(pc) = peers.write().remove(&id) {
                        tokio::spawn(async move {
                            if let Err(e) = PeerConnectionManager::close(&pc).await {
                                debug!("Closing peer {}: {}", id, e);
                            }
                        });
                    }
                }
                _ => {}
            }
        });
    }
}

#[async_trait]
impl MediaSink for WebRtcMediaSink {
    async fn send_video(&self, nal_data: Bytes, pts_micros: i64) -> Result<(), WebRTCError> {
        let duration = self.video_clock.lock().next_duration(pts_micros);
        let sample = Sample {
            data: nal::ensure_start_code(nal_data),
            duration,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_micros(pts_micros.max(0) as u64),
            ..Default::default()
        };
        self.video_track
            .write_sample(&sample)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to write video sample: {}", e)))
    }

    async fn send_audio(&self, chunk: Bytes, pts_micros: i64) -> Result<(), WebRTCError> {
        let Some(track) = &self.audio_track else {
            return Ok(());
        };
        let duration = self.audio_clock.lock().next_duration(pts_micros);
        let sample = Sample {
            data: chunk,
            duration,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_micros(pts_micros.max(0) as u64),
            ..Default::default()
        };
        track
            .write_sample(&sample)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to write audio sample: {}", e)))
    }

    async fn negotiate(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, WebRTCError> {
        let pc = self.manager.create_peer_connection().await?;
        let id = Uuid::new_v4();

        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = vec![self.video_track.clone()];
        if let Some(audio) = &self.audio_track {
            tracks.push(audio.clone());
        }
        for track in tracks {
            let sender = pc.add_track(track).await
                .map_err(|e| WebRTCError::MediaError(format!("Failed to add track: {}", e)))?;
            // Drain RTCP so interceptors (NACK, PLI) keep working
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        self.watch_ice_state(id, &pc);
        self.peers.write().insert(id, pc.clone());

        match PeerConnectionManager::handle_offer(&pc, offer).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                warn!("Negotiation for peer {} failed: {}", id, e);
                self.peers.write().remove(&id);
                let _ = PeerConnectionManager::close(&pc).await;
                Err(e)
            }
        }
    }
}
