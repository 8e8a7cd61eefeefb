//! In-band Opus identification header
//!
//! The agent delivers the raw `OpusHead` as a config frame. It is forwarded to
//! the media sink wrapped as:
//!
//! ```text
//! "AOPUSHD" (7 bytes) | length (u64 LE) | OpusHead bytes
//! ```
//!
//! so the receiving decoder can initialise itself from the audio stream.

use bytes::{BufMut, Bytes, BytesMut};

pub const CONFIG_MAGIC: &[u8; 7] = b"AOPUSHD";

const LENGTH_SIZE: usize = 8;
const OPUS_HEAD_MAGIC: &[u8; 8] = b"OpusHead";
const OPUS_HEAD_SIZE: usize = 19;

/// Wrap a raw identification header into a self-describing chunk
pub fn wrap_config(raw_head: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(CONFIG_MAGIC.len() + LENGTH_SIZE + raw_head.len());
    out.put_slice(CONFIG_MAGIC);
    out.put_u64_le(raw_head.len() as u64);
    out.put_slice(raw_head);
    out.freeze()
}

/// True when the chunk starts with the config magic and must not be decoded
pub fn is_config_chunk(chunk: &[u8]) -> bool {
    chunk.starts_with(CONFIG_MAGIC)
}

/// Extract the raw header from a wrapped chunk.
///
/// Returns `None` if the magic is missing or the declared length overruns
/// the chunk.
pub fn unwrap_config(chunk: &[u8]) -> Option<&[u8]> {
    if !is_config_chunk(chunk) {
        return None;
    }
    let body = &chunk[CONFIG_MAGIC.len()..];
    let len_bytes: [u8; LENGTH_SIZE] = body.get(..LENGTH_SIZE)?.try_into().ok()?;
    let len = usize::try_from(u64::from_le_bytes(len_bytes)).ok()?;
    body.get(LENGTH_SIZE..LENGTH_SIZE.checked_add(len)?)
}

/// Decoded Opus identification header (RFC 7845 section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusHead {
    pub version: u8,
    pub channels: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    pub output_gain: i16,
    pub mapping_family: u8,
}

impl OpusHead {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < OPUS_HEAD_SIZE || &data[..8] != OPUS_HEAD_MAGIC {
            return None;
        }
        Some(Self {
            version: data[8],
            channels: data[9],
            pre_skip: u16::from_le_bytes([data[10], data[11]]),
            input_sample_rate: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            output_gain: i16::from_le_bytes([data[16], data[17]]),
            mapping_family: data[18],
        })
    }
}
