//! H264 NAL unit helpers
//!
//! Annex-B start code handling and NAL header classification shared by the
//! TCP reframer and the RTP depacketizer.

use bytes::{BufMut, Bytes, BytesMut};

/// 4-byte Annex-B start code emitted in front of every unit
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit type (low 5 bits of the NAL header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalType {
    Unspecified,
    Slice,
    PartitionA,
    PartitionB,
    PartitionC,
    Idr,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    Filler,
    StapA,
    FuA,
    Other(u8),
}

impl NalType {
    /// Classify from a NAL header byte
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1F {
            0 => NalType::Unspecified,
            1 => NalType::Slice,
            2 => NalType::PartitionA,
            3 => NalType::PartitionB,
            4 => NalType::PartitionC,
            5 => NalType::Idr,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::AccessUnitDelimiter,
            10 => NalType::EndOfSequence,
            11 => NalType::EndOfStream,
            12 => NalType::Filler,
            24 => NalType::StapA,
            28 => NalType::FuA,
            other => NalType::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            NalType::Unspecified => 0,
            NalType::Slice => 1,
            NalType::PartitionA => 2,
            NalType::PartitionB => 3,
            NalType::PartitionC => 4,
            NalType::Idr => 5,
            NalType::Sei => 6,
            NalType::Sps => 7,
            NalType::Pps => 8,
            NalType::AccessUnitDelimiter => 9,
            NalType::EndOfSequence => 10,
            NalType::EndOfStream => 11,
            NalType::Filler => 12,
            NalType::StapA => 24,
            NalType::FuA => 28,
            NalType::Other(v) => *v,
        }
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalType::Sps | NalType::Pps)
    }
}

/// A single NAL unit.
///
/// `data` never carries a leading start code; `data[0]` is the NAL header and
/// always agrees with `nal_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub nal_type: NalType,
    /// Microseconds on the TCP side, RTP clock ticks on the relay side
    pub timestamp: i64,
    pub data: Bytes,
}

impl NalUnit {
    /// Build a unit from header-first bytes. Returns `None` for an empty slice.
    pub fn new(data: Bytes, timestamp: i64) -> Option<Self> {
        let header = *data.first()?;
        Some(Self {
            nal_type: NalType::from_header(header),
            timestamp,
            data,
        })
    }

    pub fn is_key_frame(&self) -> bool {
        self.nal_type == NalType::Idr
    }

    /// Unit prefixed with the 4-byte start code
    pub fn annex_b(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(START_CODE.len() + self.data.len());
        out.put_slice(&START_CODE);
        out.put_slice(&self.data);
        out.freeze()
    }
}

/// Length of the start code at `pos` (3 or 4), if any
fn start_code_at(data: &[u8], pos: usize) -> Option<usize> {
    if pos + 4 <= data.len() && data[pos..pos + 4] == START_CODE {
        Some(4)
    } else if pos + 3 <= data.len() && data[pos..pos + 3] == [0x00, 0x00, 0x01] {
        Some(3)
    } else {
        None
    }
}

/// Strip one leading start code, if present
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    match start_code_at(data, 0) {
        Some(len) => &data[len..],
        None => data,
    }
}

pub fn has_start_code(data: &[u8]) -> bool {
    start_code_at(data, 0).is_some()
}

/// Prefix `data` with a start code unless it already has one
pub fn ensure_start_code(data: Bytes) -> Bytes {
    if has_start_code(&data) {
        return data;
    }
    let mut out = BytesMut::with_capacity(START_CODE.len() + data.len());
    out.put_slice(&START_CODE);
    out.put_slice(&data);
    out.freeze()
}

/// Split an Annex-B buffer into NAL bodies (start codes removed).
///
/// Bytes before the first start code are ignored, as are empty units
/// produced by back-to-back start codes.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut i = 0;
    let mut current: Option<usize> = None;

    while i < data.len() {
        if let Some(len) = start_code_at(data, i) {
            if let Some(begin) = current.take() {
                if i > begin {
                    units.push(&data[begin..i]);
                }
            }
            i += len;
            current = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(begin) = current {
        if begin < data.len() {
            units.push(&data[begin..]);
        }
    }
    units
}
