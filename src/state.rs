//! Shared stream state for castbridge
//!
//! Holds the video/audio parameters announced by the capture agent and the
//! viewer-facing flags reported in `infoNotify`. Changes are published on a
//! broadcast channel so the signaling hub can notify viewers.

use crate::config::Config;
use log::info;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Snapshot of the stream parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    /// Codec named in the video preamble ("h264", "h265", "av1")
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub orientation: u32,
    /// maxSize requested by the last viewer login
    pub max_size: u32,
    pub use_adb: bool,
    pub adb_connected: bool,
    /// Sample rate from the last Opus identification header
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
}

/// Stream state change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    GeometryChanged { width: u32, height: u32 },
    AudioConfigured { sample_rate: u32, channels: u8 },
    AdbStateChanged { connected: bool },
}

/// Shared state for the bridge
#[derive(Clone)]
pub struct StreamState {
    info: Arc<RwLock<StreamInfo>>,

    /// State change broadcast sender
    events: broadcast::Sender<StreamEvent>,

    /// Live WebRTC peer count
    peer_count: Arc<AtomicU64>,

    /// Server start time
    pub start_time: std::time::Instant,
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamState")
            .field("info", &*self.info.read())
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl StreamState {
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            info: Arc::new(RwLock::new(StreamInfo {
                codec: "h264".to_string(),
                width: config.video.width,
                height: config.video.height,
                orientation: config.video.orientation,
                max_size: config.video.max_size,
                use_adb: config.receiver.use_adb,
                adb_connected: false,
                audio_sample_rate: config.audio.sample_rate,
                audio_channels: config.audio.channels as u8,
            })),
            events,
            peer_count: Arc::new(AtomicU64::new(0)),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn info(&self) -> StreamInfo {
        self.info.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StreamEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn set_codec(&self, codec: &str) {
        self.info.write().codec = codec.to_string();
    }

    /// Record a new video geometry. Returns true (and notifies) when it
    /// differs from the current one.
    pub fn update_geometry(&self, width: u32, height: u32) -> bool {
        {
            let mut info = self.info.write();
            if info.width == width && info.height == height {
                return false;
            }
            info.width = width;
            info.height = height;
        }
        info!("Video geometry changed to {}x{}", width, height);
        self.publish(StreamEvent::GeometryChanged { width, height });
        true
    }

    pub fn set_audio_format(&self, sample_rate: u32, channels: u8) {
        {
            let mut info = self.info.write();
            info.audio_sample_rate = sample_rate;
            info.audio_channels = channels;
        }
        self.publish(StreamEvent::AudioConfigured { sample_rate, channels });
    }

    pub fn set_max_size(&self, max_size: u32) {
        self.info.write().max_size = max_size;
    }

    pub fn set_adb_connected(&self, connected: bool) {
        {
            let mut info = self.info.write();
            if info.adb_connected == connected {
                return;
            }
            info.adb_connected = connected;
        }
        self.publish(StreamEvent::AdbStateChanged { connected });
    }

    pub fn peer_count(&self) -> u64 {
        self.peer_count.load(Ordering::Relaxed)
    }

    pub fn peer_connected(&self) -> u64 {
        self.peer_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn peer_disconnected(&self) -> u64 {
        let previous = self
            .peer_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}
