//! Capture-agent accept loop
//!
//! The agent opens one TCP socket per role. Each accepted socket gets its own
//! task, which sniffs the preamble and then runs the matching handler until
//! the socket closes.

use super::frame::{self, AudioCodec, StreamKind, VideoCodec};
use super::opus_header::{self, OpusHead};
use super::reframer::NalReframer;
use super::ReceiverError;
use crate::config::ReceiverConfig;
use crate::media::MediaSink;
use crate::state::StreamState;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const DEVICE_NAME_SIZE: usize = 64;

/// Byte stream handed out for the agent's control channel
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

/// Events for the embedding layer
pub enum ReceiverEvent {
    /// The agent opened its control socket; the receiver no longer reads it
    ControlChannel {
        peer: String,
        stream: Box<dyn ControlStream>,
    },
    /// Device name announced by an adb-launched agent
    DeviceName(String),
}

impl std::fmt::Debug for ReceiverEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverEvent::ControlChannel { peer, .. } => {
                f.debug_struct("ControlChannel").field("peer", peer).finish()
            }
            ReceiverEvent::DeviceName(name) => f.debug_tuple("DeviceName").field(name).finish(),
        }
    }
}

pub struct Receiver {
    config: ReceiverConfig,
    state: StreamState,
    sink: Arc<dyn MediaSink>,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    awaiting_device_name: AtomicBool,
}

impl Receiver {
    pub fn new(
        config: ReceiverConfig,
        state: StreamState,
        sink: Arc<dyn MediaSink>,
        events: mpsc::UnboundedSender<ReceiverEvent>,
    ) -> Arc<Self> {
        let awaiting_device_name = AtomicBool::new(config.use_adb);
        Arc::new(Self {
            config,
            state,
            sink,
            events,
            awaiting_device_name,
        })
    }

    /// Accept agent sockets until the listener fails
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), ReceiverError> {
        if let Ok(addr) = listener.local_addr() {
            info!("Receiver listening on {}", addr);
        }
        loop {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let receiver = self.clone();
            tokio::spawn(async move {
                let peer = peer.to_string();
                match receiver.handle_connection(stream, peer.clone()).await {
                    Ok(()) | Err(ReceiverError::Closed) => info!("Agent connection {} closed", peer),
                    Err(e) => warn!("Agent connection {} ended: {}", peer, e),
                }
            });
        }
    }

    /// Serve one accepted socket
    pub async fn handle_connection<S>(&self, mut stream: S, peer: String) -> Result<(), ReceiverError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.awaiting_device_name.swap(false, Ordering::SeqCst) {
            let name = read_device_name(&mut stream).await?;
            info!("Agent device: {}", name);
            self.state.set_adb_connected(true);
            let _ = self.events.send(ReceiverEvent::DeviceName(name));
        }

        let timeout = Duration::from_millis(self.config.sniff_timeout_ms);
        match frame::sniff_stream_kind(&mut stream, timeout).await? {
            StreamKind::Video { codec, width, height } => {
                info!("Video stream from {}: {} {}x{}", peer, codec.as_str(), width, height);
                self.state.set_codec(codec.as_str());
                if width > 0 && height > 0 {
                    self.state.update_geometry(width, height);
                }
                let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stream);
                self.run_video(&mut reader, codec).await
            }
            StreamKind::Audio(codec) => {
                info!("Audio stream from {}: {:?}", peer, codec);
                let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stream);
                self.run_audio(&mut reader, codec).await
            }
            StreamKind::Control => {
                info!("Control channel from {}", peer);
                let _ = self.events.send(ReceiverEvent::ControlChannel {
                    peer,
                    stream: Box::new(stream),
                });
                Ok(())
            }
        }
    }

    async fn run_video<R>(&self, reader: &mut R, codec: VideoCodec) -> Result<(), ReceiverError>
    where
        R: AsyncRead + Unpin,
    {
        if codec != VideoCodec::H264 {
            warn!("{} frames are forwarded without reframing", codec.as_str());
        }
        let mut reframer = NalReframer::new();
        loop {
            let frame = match frame::read_frame(reader, self.config.max_frame_size).await {
                Ok(frame) => frame,
                Err(ReceiverError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };

            if codec != VideoCodec::H264 {
                let pts = frame.pts() as i64;
                self.forward_video(frame.payload, pts).await;
                continue;
            }

            let out = reframer.process_frame(&frame);
            if let Some(sps) = out.parameter_sets {
                debug!(
                    "SPS: profile {} level {} {}x{}",
                    sps.profile_idc, sps.level_idc, sps.width, sps.height
                );
                if sps.width != self.state.info().width {
                    self.state.update_geometry(sps.width, sps.height);
                }
            }
            for unit in out.units {
                self.forward_video(unit.annex_b(), unit.timestamp).await;
            }
        }
    }

    async fn forward_video(&self, data: bytes::Bytes, pts: i64) {
        if let Err(e) = self.sink.send_video(data, pts).await {
            debug!("Video sample dropped: {}", e);
        }
    }

    async fn run_audio<R>(&self, reader: &mut R, codec: AudioCodec) -> Result<(), ReceiverError>
    where
        R: AsyncRead + Unpin,
    {
        if codec != AudioCodec::Opus {
            warn!("{:?} audio is forwarded unchanged to the Opus track", codec);
        }
        loop {
            let frame = match frame::read_frame(reader, self.config.max_frame_size).await {
                Ok(frame) => frame,
                Err(ReceiverError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };

            let chunk = if frame.is_config() && codec == AudioCodec::Opus {
                match OpusHead::parse(&frame.payload) {
                    Some(head) => {
                        info!(
                            "Opus header: {} Hz, {} channels, pre-skip {}",
                            head.input_sample_rate, head.channels, head.pre_skip
                        );
                        self.state.set_audio_format(head.input_sample_rate, head.channels);
                    }
                    None => debug!("Audio config frame is not an OpusHead"),
                }
                opus_header::wrap_config(&frame.payload)
            } else {
                frame.payload
            };

            if let Err(e) = self.sink.send_audio(chunk, frame.header.pts as i64).await {
                debug!("Audio sample dropped: {}", e);
            }
        }
    }
}

/// Read the NUL-padded device name sent ahead of the first stream
async fn read_device_name<R>(reader: &mut R) -> Result<String, ReceiverError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; DEVICE_NAME_SIZE];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ReceiverError::TruncatedPreamble
        } else {
            ReceiverError::Io(e)
        }
    })?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_SIZE);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
