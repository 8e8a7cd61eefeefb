//! Re-framing of depacketized H264 for a local consumer
//!
//! Units are written back out in the agent's wire format (12-byte header +
//! Annex B payload) so a player that understands the capture stream can read
//! the relay's output unchanged.

use crate::receiver::frame::FrameHeader;
use crate::receiver::nal::{NalType, NalUnit};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// RTP clock rate of H264 video
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

pub struct FramedNalWriter<W> {
    inner: W,
    clock_rate: u32,
    written: u64,
}

impl<W: AsyncWrite + Unpin> FramedNalWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_clock_rate(inner, VIDEO_CLOCK_RATE)
    }

    pub fn with_clock_rate(inner: W, clock_rate: u32) -> Self {
        Self {
            inner,
            clock_rate: clock_rate.max(1),
            written: 0,
        }
    }

    /// Slices, IDR slices and parameter sets are relayed; everything else
    /// (SEI, AUD, filler) is dropped
    pub fn forwards(nal_type: NalType) -> bool {
        nal_type.is_parameter_set() || matches!(nal_type, NalType::Slice | NalType::Idr)
    }

    /// Write one unit. Returns `false` when the unit type is not relayed.
    pub async fn write_unit(&mut self, unit: &NalUnit) -> std::io::Result<bool> {
        if !Self::forwards(unit.nal_type) {
            return Ok(false);
        }

        let payload = unit.annex_b();
        let header = FrameHeader {
            is_config: false,
            is_key_frame: unit.is_key_frame(),
            pts: self.ticks_to_micros(unit.timestamp),
            length: payload.len() as u32,
        };
        self.inner.write_all(&header.encode()).await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        self.written += 1;
        Ok(true)
    }

    pub fn units_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn ticks_to_micros(&self, ticks: i64) -> u64 {
        (ticks.max(0) as u64).saturating_mul(1_000_000) / self.clock_rate as u64
    }
}
