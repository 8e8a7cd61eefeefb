//! H264 RTP depacketizer (RFC 6184)
//!
//! Handles single NAL unit packets, FU-A fragments and STAP-A aggregates.
//! Fragments are not reordered: a continuation whose RTP timestamp differs
//! from the one that started the unit is dropped.

use crate::receiver::nal::{NalType, NalUnit};
use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;
use webrtc::rtp::packet::Packet;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

#[derive(Debug, Default)]
struct AssemblyState {
    fragment: Option<BytesMut>,
    last_timestamp: u32,
    sps: Option<NalUnit>,
    pps: Option<NalUnit>,
}

/// Per-track depacketizer. State sits behind a lock so diagnostics can read
/// it while the track reader feeds packets.
#[derive(Debug, Default)]
pub struct RtpDepacketizer {
    state: Mutex<AssemblyState>,
}

impl RtpDepacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_rtp(&self, packet: &Packet) -> Vec<NalUnit> {
        self.process_payload(&packet.payload, packet.header.timestamp)
    }

    /// Depacketize one RTP payload, returning completed units in order
    pub fn process_payload(&self, payload: &[u8], timestamp: u32) -> Vec<NalUnit> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        let Some(&first) = payload.first() else {
            return out;
        };

        match first & 0x1F {
            1..=23 => Self::emit(&mut state, Bytes::copy_from_slice(payload), timestamp, &mut out),
            28 => Self::process_fu_a(&mut state, payload, timestamp, &mut out),
            24 => Self::process_stap_a(&mut state, payload, timestamp, &mut out),
            other => debug!("Ignoring RTP payload with NAL type {}", other),
        }
        out
    }

    fn process_fu_a(state: &mut AssemblyState, payload: &[u8], timestamp: u32, out: &mut Vec<NalUnit>) {
        if payload.len() < 2 {
            return;
        }
        let fu_header = payload[1];
        let start = fu_header & FU_START != 0;
        let end = fu_header & FU_END != 0;

        if start {
            let mut buffer = BytesMut::with_capacity(payload.len() * 4);
            buffer.put_u8((payload[0] & 0xE0) | (fu_header & 0x1F));
            buffer.put_slice(&payload[2..]);
            state.fragment = Some(buffer);
            state.last_timestamp = timestamp;
        } else if timestamp == state.last_timestamp {
            if let Some(buffer) = state.fragment.as_mut() {
                buffer.put_slice(&payload[2..]);
            }
        } else {
            debug!(
                "Dropping FU-A continuation (ts {} != {})",
                timestamp, state.last_timestamp
            );
        }

        if end {
            if let Some(buffer) = state.fragment.take() {
                Self::emit(state, buffer.freeze(), timestamp, out);
            }
        }
    }

    fn process_stap_a(state: &mut AssemblyState, payload: &[u8], timestamp: u32, out: &mut Vec<NalUnit>) {
        let mut offset = 1;
        while offset + 2 <= payload.len() {
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if offset + size > payload.len() {
                debug!("STAP-A unit of {} bytes overruns payload", size);
                break;
            }
            Self::emit(
                state,
                Bytes::copy_from_slice(&payload[offset..offset + size]),
                timestamp,
                out,
            );
            offset += size;
        }
    }

    fn emit(state: &mut AssemblyState, data: Bytes, timestamp: u32, out: &mut Vec<NalUnit>) {
        let Some(unit) = NalUnit::new(data, timestamp as i64) else {
            return;
        };
        match unit.nal_type {
            NalType::Sps => state.sps = Some(unit.clone()),
            NalType::Pps => state.pps = Some(unit.clone()),
            _ => {}
        }
        out.push(unit);
    }

    pub fn cached_sps(&self) -> Option<NalUnit> {
        self.state.lock().sps.clone()
    }

    pub fn cached_pps(&self) -> Option<NalUnit> {
        self.state.lock().pps.clone()
    }

    /// True while a FU-A unit is partially assembled
    pub fn is_assembling(&self) -> bool {
        self.state.lock().fragment.is_some()
    }
}
