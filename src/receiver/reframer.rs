//! Frame to NAL unit reframing for the video socket
//!
//! Every key frame leaves the reframer preceded by the most recent SPS and
//! PPS, so a decoder joining mid-stream can start at any IDR.
//!
//! The agent sends parameter sets as one frame holding exactly an SPS and a
//! PPS, each behind a start code. Other arrangements are not recognised.

use super::frame::Frame;
use super::nal::{self, NalType, NalUnit};
use super::sps::{self, SpsInfo};
use log::debug;

/// Output of one [`NalReframer::process_frame`] call
#[derive(Debug, Default)]
pub struct Reframed {
    /// Units to hand to the media sink, in order
    pub units: Vec<NalUnit>,
    /// Decoded SPS when the frame carried fresh parameter sets
    pub parameter_sets: Option<SpsInfo>,
}

/// Per-connection reframer. Owns the cached parameter sets.
#[derive(Debug, Default)]
pub struct NalReframer {
    sps: Option<NalUnit>,
    pps: Option<NalUnit>,
}

impl NalReframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_sps(&self) -> Option<&NalUnit> {
        self.sps.as_ref()
    }

    pub fn cached_pps(&self) -> Option<&NalUnit> {
        self.pps.as_ref()
    }

    pub fn process_frame(&mut self, frame: &Frame) -> Reframed {
        let payload = &frame.payload;
        let timestamp = frame.pts() as i64;
        let body = nal::strip_start_code(payload);
        let Some(&header) = body.first() else {
            debug!("Dropping empty video frame (pts={})", timestamp);
            return Reframed::default();
        };

        if NalType::from_header(header) == NalType::Sps {
            return self.cache_parameter_sets(frame);
        }

        let mut out = Reframed::default();
        if frame.is_key_frame() {
            for cached in [&self.sps, &self.pps].into_iter().flatten() {
                out.units.push(NalUnit {
                    timestamp,
                    ..cached.clone()
                });
            }
        }

        let offset = payload.len() - body.len();
        if let Some(unit) = NalUnit::new(payload.slice(offset..), timestamp) {
            out.units.push(unit);
        }
        out
    }

    fn cache_parameter_sets(&mut self, frame: &Frame) -> Reframed {
        let timestamp = frame.pts() as i64;
        let parts = nal::split_annex_b(&frame.payload);
        if parts.len() != 2 {
            debug!(
                "Parameter set frame holds {} units, expected SPS+PPS",
                parts.len()
            );
        }
        let (Some(sps_raw), Some(pps_raw)) = (parts.first(), parts.get(1)) else {
            return Reframed::default();
        };

        let sps_unit = NalUnit::new(frame.payload.slice_ref(sps_raw), timestamp);
        let pps_unit = NalUnit::new(frame.payload.slice_ref(pps_raw), timestamp);
        let (Some(sps_unit), Some(pps_unit)) = (sps_unit, pps_unit) else {
            return Reframed::default();
        };

        let parameter_sets = sps::parse_sps(&sps_unit.data);
        if parameter_sets.is_none() {
            debug!("Could not decode SPS ({} bytes)", sps_unit.data.len());
        }

        self.sps = Some(sps_unit.clone());
        self.pps = Some(pps_unit.clone());

        Reframed {
            units: vec![sps_unit, pps_unit],
            parameter_sets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::frame::FrameHeader;
    use crate::receiver::sps::tests::sps_1080p;
    use bytes::Bytes;

    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn frame(payload: Vec<u8>, is_key_frame: bool, pts: u64) -> Frame {
        Frame {
            header: FrameHeader {
                is_config: false,
                is_key_frame,
                pts,
                length: payload.len() as u32,
            },
            payload: Bytes::from(payload),
        }
    }

    fn config_payload() -> Vec<u8> {
        let mut payload = nal::START_CODE.to_vec();
        payload.extend(sps_1080p());
        payload.extend_from_slice(&nal::START_CODE);
        payload.extend_from_slice(&PPS);
        payload
    }

    #[test]
    fn test_config_frame_emits_sps_then_pps() {
        let mut reframer = NalReframer::new();
        let mut config = frame(config_payload(), false, 0);
        config.header.is_config = true;

        let out = reframer.process_frame(&config);
        assert_eq!(out.units.len(), 2);
        assert_eq!(out.units[0].nal_type, NalType::Sps);
        assert_eq!(&out.units[0].data[..], &sps_1080p()[..]);
        assert_eq!(out.units[1].nal_type, NalType::Pps);
        assert_eq!(&out.units[1].data[..], &PPS);

        let info = out.parameter_sets.unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!(reframer.cached_sps().is_some());
        assert!(reframer.cached_pps().is_some());
    }

    #[test]
    fn test_key_frame_preceded_by_parameter_sets() {
        let mut reframer = NalReframer::new();
        reframer.process_frame(&frame(config_payload(), false, 0));

        let mut idr = nal::START_CODE.to_vec();
        idr.extend_from_slice(&[0x65, 0x88, 0x84, 0x00]);
        let out = reframer.process_frame(&frame(idr, true, 40_000));

        let types: Vec<NalType> = out.units.iter().map(|u| u.nal_type).collect();
        assert_eq!(types, vec![NalType::Sps, NalType::Pps, NalType::Idr]);
        assert!(out.units.iter().all(|u| u.timestamp == 40_000));
        assert!(out.parameter_sets.is_none());
    }

    #[test]
    fn test_delta_frame_forwarded_alone() {
        let mut reframer = NalReframer::new();
        reframer.process_frame(&frame(config_payload(), false, 0));

        let out = reframer.process_frame(&frame(vec![0, 0, 0, 1, 0x41, 0x9A], false, 80_000));
        assert_eq!(out.units.len(), 1);
        assert_eq!(out.units[0].nal_type, NalType::Slice);
        assert_eq!(&out.units[0].annex_b()[..], &[0, 0, 0, 1, 0x41, 0x9A]);
    }

    #[test]
    fn test_key_frame_without_cache() {
        let mut reframer = NalReframer::new();
        let out = reframer.process_frame(&frame(vec![0x65, 0x88], true, 1));
        assert_eq!(out.units.len(), 1);
        assert!(out.units[0].is_key_frame());
    }

    #[test]
    fn test_empty_and_malformed_frames_dropped() {
        let mut reframer = NalReframer::new();
        assert!(reframer.process_frame(&frame(vec![], false, 0)).units.is_empty());
        assert!(reframer.process_frame(&frame(vec![0, 0, 0, 1], false, 0)).units.is_empty());

        // SPS without a following PPS
        let mut lone_sps = nal::START_CODE.to_vec();
        lone_sps.extend(sps_1080p());
        assert!(reframer.process_frame(&frame(lone_sps, false, 0)).units.is_empty());
        assert!(reframer.cached_sps().is_none());
    }
}
