//! Frame header and stream preamble codec
//!
//! Each media socket starts with a 4-byte ASCII preamble naming the codec,
//! then carries frames made of a 12-byte big-endian header and a payload:
//!
//! ```text
//! bit  63     : config packet
//! bit  62     : key frame
//! bits 0..61  : pts
//! bytes 8..11 : payload length (u32)
//! ```

use super::ReceiverError;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the fixed frame header
pub const FRAME_HEADER_SIZE: usize = 12;

/// Size of the stream-type preamble
pub const PREAMBLE_SIZE: usize = 4;

const CONFIG_FLAG: u64 = 1 << 63;
const KEY_FRAME_FLAG: u64 = 1 << 62;
const PTS_MASK: u64 = KEY_FRAME_FLAG - 1;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub is_config: bool,
    pub is_key_frame: bool,
    /// Presentation timestamp, always below 2^62
    pub pts: u64,
    pub length: u32,
}

impl FrameHeader {
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let word = u64::from_be_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        Self {
            is_config: word & CONFIG_FLAG != 0,
            is_key_frame: word & KEY_FRAME_FLAG != 0,
            pts: word & PTS_MASK,
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// Encode the header. `pts` bits above 61 are discarded.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut word = self.pts & PTS_MASK;
        if self.is_config {
            word |= CONFIG_FLAG;
        }
        if self.is_key_frame {
            word |= KEY_FRAME_FLAG;
        }
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[..8].copy_from_slice(&word.to_be_bytes());
        out[8..].copy_from_slice(&self.length.to_be_bytes());
        out
    }
}

/// One frame read off a media socket
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_config(&self) -> bool {
        self.header.is_config
    }

    pub fn is_key_frame(&self) -> bool {
        self.header.is_key_frame
    }

    pub fn pts(&self) -> u64 {
        self.header.pts
    }
}

/// Read exactly one frame header.
///
/// A clean EOF before the first byte yields [`ReceiverError::Closed`]; an EOF
/// inside the header yields [`ReceiverError::TruncatedHeader`].
pub async fn read_frame_header<R>(reader: &mut R) -> Result<FrameHeader, ReceiverError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                ReceiverError::Closed
            } else {
                ReceiverError::TruncatedHeader
            });
        }
        filled += n;
    }
    Ok(FrameHeader::decode(&buf))
}

/// Read a header and its payload. Payloads above `max_len` are refused
/// without being read.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Frame, ReceiverError>
where
    R: AsyncRead + Unpin,
{
    let header = read_frame_header(reader).await?;
    let len = header.length as usize;
    if len > max_len {
        return Err(ReceiverError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ReceiverError::TruncatedPayload { expected: len }
        } else {
            ReceiverError::Io(e)
        }
    })?;
    Ok(Frame {
        header,
        payload: Bytes::from(payload),
    })
}

/// Video codec announced in the preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    AV1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::AV1 => "av1",
        }
    }
}

/// Audio codec announced in the preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    Aac,
    Raw,
}

/// Role of an accepted socket, decided once from its preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video {
        codec: VideoCodec,
        width: u32,
        height: u32,
    },
    Audio(AudioCodec),
    Control,
}

impl StreamKind {
    /// Classify a preamble. Three-letter names are NUL padded on the wire.
    pub fn from_preamble(preamble: &[u8; PREAMBLE_SIZE]) -> Option<Self> {
        match preamble {
            b"h264" => Some(StreamKind::Video { codec: VideoCodec::H264, width: 0, height: 0 }),
            b"h265" => Some(StreamKind::Video { codec: VideoCodec::H265, width: 0, height: 0 }),
            b"av1\0" | b"av1 " => {
                Some(StreamKind::Video { codec: VideoCodec::AV1, width: 0, height: 0 })
            }
            b"opus" => Some(StreamKind::Audio(AudioCodec::Opus)),
            b"aac\0" | b"aac " => Some(StreamKind::Audio(AudioCodec::Aac)),
            b"raw\0" | b"raw " => Some(StreamKind::Audio(AudioCodec::Raw)),
            _ => None,
        }
    }
}

/// Sniff the role of a freshly accepted socket.
///
/// The preamble read is bounded by `timeout`: the agent's control socket
/// sends nothing up front, so a silent peer (or any unknown preamble) is
/// classified as [`StreamKind::Control`]. Video preambles are followed by
/// 8 bytes of big-endian width and height.
pub async fn sniff_stream_kind<R>(reader: &mut R, timeout: Duration) -> Result<StreamKind, ReceiverError>
where
    R: AsyncRead + Unpin,
{
    let mut preamble = [0u8; PREAMBLE_SIZE];
    match tokio::time::timeout(timeout, reader.read_exact(&mut preamble)).await {
        Err(_) => return Ok(StreamKind::Control),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ReceiverError::Closed)
        }
        Ok(Err(e)) => return Err(ReceiverError::Io(e)),
        Ok(Ok(_)) => {}
    }

    match StreamKind::from_preamble(&preamble) {
        Some(StreamKind::Video { codec, .. }) => {
            let mut params = [0u8; 8];
            reader.read_exact(&mut params).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    ReceiverError::TruncatedPreamble
                } else {
                    ReceiverError::Io(e)
                }
            })?;
            Ok(StreamKind::Video {
                codec,
                width: u32::from_be_bytes([params[0], params[1], params[2], params[3]]),
                height: u32::from_be_bytes([params[4], params[5], params[6], params[7]]),
            })
        }
        Some(kind) => Ok(kind),
        None => Ok(StreamKind::Control),
    }
}
