//! Relay client
//!
//! Logs into a bridge like a browser viewer would, receives its WebRTC
//! stream and writes the video back out as framed H264.

use super::writer::FramedNalWriter;
use super::ViewerError;
use crate::config::{ViewerConfig, WebRTCConfig};
use crate::receiver::opus_header::{self, OpusHead};
use crate::signaling::auth::{compute_token, unix_millis};
use crate::signaling::message::{Embedded, LoginRequest};
use crate::signaling::{ClientMessage, ServerMessage};
use crate::webrtc::{PeerConnectionManager, RtpDepacketizer};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

type SharedWriter<W> = Arc<Mutex<FramedNalWriter<W>>>;

pub struct ViewerClient {
    config: ViewerConfig,
    password: String,
    manager: PeerConnectionManager,
}

/// Build the `loginAuth` message answering `security_key`
pub fn login_message(security_key: &str, password: &str, max_size: Option<u32>, now_ms: i64) -> ClientMessage {
    ClientMessage::LoginAuth(Embedded(LoginRequest {
        max_size,
        token: compute_token(security_key, now_ms, password),
        timestamp: now_ms,
    }))
}

impl ViewerClient {
    pub fn new(config: ViewerConfig, password: String, webrtc: WebRTCConfig) -> Self {
        Self {
            config,
            password,
            manager: PeerConnectionManager::new(webrtc),
        }
    }

    /// Run until the signaling connection closes
    pub async fn run<W>(&self, output: W) -> Result<(), ViewerError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.server_url.as_str()).await?;
        info!("Connected to bridge at {}", self.config.server_url);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let writer: SharedWriter<W> = Arc::new(Mutex::new(FramedNalWriter::new(output)));
        let mut peer: Option<Arc<RTCPeerConnection>> = None;

        let result = loop {
            let text = match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Err(ViewerError::from(e)),
            };

            let msg = match serde_json::from_str::<ServerMessage>(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Ignoring signaling message: {}", e);
                    continue;
                }
            };

            let reply = match msg {
                ServerMessage::InitConfig(init) => {
                    debug!("Bridge runs on {}", init.os);
                    Some(login_message(
                        &init.security_key,
                        &self.password,
                        Some(self.config.max_size),
                        unix_millis(),
                    ))
                }
                ServerMessage::LoginAuthResp(result) if !result.auth => break Err(ViewerError::AuthRejected),
                ServerMessage::LoginAuthResp(_) => {
                    info!("Logged in, requesting stream");
                    let pc = self.start_receive(writer.clone()).await?;
                    let offer = PeerConnectionManager::create_offer(&pc).await?;
                    peer = Some(pc);
                    Some(ClientMessage::Offer(Embedded(offer)))
                }
                ServerMessage::OfferResponse(result) => {
                    match (result.sdp, &peer) {
                        (Some(answer), Some(pc)) => PeerConnectionManager::handle_answer(pc, answer).await?,
                        (Some(_), None) => warn!("Answer received without a pending offer"),
                        (None, _) => {
                            let reason = result.error.unwrap_or_else(|| "no answer".to_string());
                            break Err(ViewerError::Protocol(format!("Offer refused: {}", reason)));
                        }
                    }
                    None
                }
                ServerMessage::InfoNotify(info) => {
                    info!(
                        "Stream {}x{} orientation {}",
                        info.video_width, info.video_height, info.orientation
                    );
                    None
                }
                other => {
                    debug!("Unhandled message: {:?}", other);
                    None
                }
            };

            if let Some(reply) = reply {
                let text = serde_json::to_string(&reply)
                    .map_err(|e| ViewerError::Protocol(format!("Failed to encode message: {}", e)))?;
                ws_sender.send(Message::Text(text.into())).await?;
            }
        };

        if let Some(pc) = peer {
            let _ = PeerConnectionManager::close(&pc).await;
        }
        info!("Relay stopped ({} units written)", writer.lock().await.units_written());
        result
    }

    async fn start_receive<W>(&self, writer: SharedWriter<W>) -> Result<Arc<RTCPeerConnection>, ViewerError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pc = self.manager.create_peer_connection().await?;
        PeerConnectionManager::add_recv_only(&pc, RTPCodecType::Video).await?;
        PeerConnectionManager::add_recv_only(&pc, RTPCodecType::Audio).await?;

        PeerConnectionManager::setup_ice_state_callback(&pc, |state: RTCIceConnectionState| {
            info!("Relay ICE state: {}", state);
        });

        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let writer = writer.clone();
                Box::pin(async move {
                    match track.kind() {
                        RTPCodecType::Video => {
                            tokio::spawn(relay_video(track, writer));
                        }
                        RTPCodecType::Audio => {
                            tokio::spawn(watch_audio(track));
                        }
                        _ => {}
                    }
                })
            },
        ));

        Ok(pc)
    }
}

async fn relay_video<W>(track: Arc<TrackRemote>, writer: SharedWriter<W>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!("Video track {} started", track.id());
    let depacketizer = RtpDepacketizer::new();
    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                info!("Video track ended: {}", e);
                return;
            }
        };
        for unit in depacketizer.process_rtp(&packet) {
            if let Err(e) = writer.lock().await.write_unit(&unit).await {
                warn!("Relay output failed: {}", e);
                return;
            }
        }
    }
}

async fn watch_audio(track: Arc<TrackRemote>) {
    info!("Audio track {} started", track.id());
    let mut packets: u64 = 0;
    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                info!("Audio track ended after {} packets: {}", packets, e);
                return;
            }
        };
        if let Some(head) = opus_header::unwrap_config(&packet.payload) {
            match OpusHead::parse(head) {
                Some(head) => info!("Opus header: {} Hz, {} channels", head.input_sample_rate, head.channels),
                None => debug!("In-band audio config is not an OpusHead"),
            }
            continue;
        }
        packets += 1;
    }
}
