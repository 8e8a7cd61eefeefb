//! H264 sequence parameter set decoding
//!
//! Only the fields needed to derive the coded picture size are decoded.

/// Geometry-relevant SPS fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

/// MSB-first bit reader over an RBSP (emulation prevention already removed)
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn read_bits(&mut self, n: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    fn read_flag(&mut self) -> Option<bool> {
        Some(self.read_bit()? == 1)
    }

    /// Unsigned Exp-Golomb
    fn read_ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(zeros)?;
        Some(((1u64 << zeros) - 1 + suffix as u64) as u32)
    }

    /// Signed Exp-Golomb
    fn read_se(&mut self) -> Option<i32> {
        let k = self.read_ue()? as i64;
        let value = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Some(value as i32)
    }
}

/// Drop emulation prevention bytes (`00 00 03` -> `00 00`)
fn to_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &byte in nal {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

fn skip_scaling_list(reader: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = reader.read_se()?;
            next_scale = (last_scale as i64 + delta as i64).rem_euclid(256) as i32;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Some(())
}

/// Widest or tallest picture accepted, in macroblocks (16384 pixels)
const MAX_DIMENSION_MBS: u32 = 1024;

const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Parse an SPS NAL unit (header byte included, no start code).
///
/// Returns `None` when the unit is not an SPS or is truncated.
pub fn parse_sps(nal: &[u8]) -> Option<SpsInfo> {
    if nal.first()? & 0x1F != 7 {
        return None;
    }
    let rbsp = to_rbsp(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)? as u8;
    let _constraint_flags = r.read_bits(8)?;
    let level_idc = r.read_bits(8)? as u8;
    let _sps_id = r.read_ue()?;

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if HIGH_PROFILES.contains(&profile_idc) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_flag()?;
        }
        let _bit_depth_luma = r.read_ue()?;
        let _bit_depth_chroma = r.read_ue()?;
        let _qpprime_bypass = r.read_flag()?;
        if r.read_flag()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_flag()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.read_ue()?;
    match r.read_ue()? {
        0 => {
            let _log2_max_poc_lsb = r.read_ue()?;
        }
        1 => {
            let _delta_always_zero = r.read_flag()?;
            let _offset_non_ref = r.read_se()?;
            let _offset_top_bottom = r.read_se()?;
            let cycle = r.read_ue()?;
            for _ in 0..cycle {
                r.read_se()?;
            }
        }
        _ => {}
    }
    let _max_num_ref_frames = r.read_ue()?;
    let _gaps_allowed = r.read_flag()?;

    let width_mbs = r.read_ue()?.checked_add(1)?;
    let height_map_units = r.read_ue()?.checked_add(1)?;
    if width_mbs > MAX_DIMENSION_MBS || height_map_units > MAX_DIMENSION_MBS {
        return None;
    }
    let frame_mbs_only = r.read_flag()?;
    if !frame_mbs_only {
        let _mb_adaptive = r.read_flag()?;
    }
    let _direct_8x8 = r.read_flag()?;

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_flag()? {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
    let (crop_unit_x, crop_unit_y) = match chroma_array_type {
        0 => (1, field_factor),
        1 => (2, 2 * field_factor),
        2 => (2, field_factor),
        _ => (1, field_factor),
    };

    let crop_x = crop_left.checked_add(crop_right)?.checked_mul(crop_unit_x)?;
    let crop_y = crop_top.checked_add(crop_bottom)?.checked_mul(crop_unit_y)?;
    let width = (width_mbs * 16).checked_sub(crop_x)?;
    let height = (field_factor * height_map_units * 16).checked_sub(crop_y)?;

    Some(SpsInfo {
        profile_idc,
        level_idc,
        width,
        height,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal MSB-first bit writer for building SPS fixtures
    pub(crate) struct BitWriter {
        bytes: Vec<u8>,
        bits: usize,
    }

    impl BitWriter {
        pub(crate) fn new() -> Self {
            Self { bytes: Vec::new(), bits: 0 }
        }

        pub(crate) fn bit(&mut self, b: u32) {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if b != 0 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 1 << (7 - (self.bits % 8));
            }
            self.bits += 1;
        }

        pub(crate) fn bits(&mut self, value: u32, n: u32) {
            for i in (0..n).rev() {
                self.bit((value >> i) & 1);
            }
        }

        pub(crate) fn ue(&mut self, value: u32) {
            let v = value + 1;
            let len = 32 - v.leading_zeros();
            self.bits(0, len - 1);
            self.bits(v, len);
        }

        pub(crate) fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit
            self.bit(1);
            self.bytes
        }
    }

    /// Baseline SPS for a 1920x1080 stream (120x68 MBs, 8 lines cropped)
    pub(crate) fn sps_1080p() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.bits(66, 8); // profile_idc
        w.bits(0xC0, 8); // constraint flags
        w.bits(40, 8); // level 4.0
        w.ue(0); // sps id
        w.ue(0); // log2_max_frame_num_minus4
        w.ue(0); // poc type
        w.ue(0); // log2_max_poc_lsb_minus4
        w.ue(1); // max_num_ref_frames
        w.bit(0); // gaps
        w.ue(119); // width in mbs - 1
        w.ue(67); // height in map units - 1
        w.bit(1); // frame_mbs_only
        w.bit(1); // direct_8x8
        w.bit(1); // cropping
        w.ue(0);
        w.ue(0);
        w.ue(0);
        w.ue(4);
        w.bit(0); // vui
        let mut nal = vec![0x67];
        nal.extend(w.finish());
        nal
    }

    #[test]
    fn test_parse_1080p() {
        let info = parse_sps(&sps_1080p()).unwrap();
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.level_idc, 40);
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
    }

    #[test]
    fn test_parse_high_profile() {
        let mut w = BitWriter::new();
        w.bits(100, 8);
        w.bits(0, 8);
        w.bits(31, 8);
        w.ue(0); // sps id
        w.ue(1); // chroma_format_idc 4:2:0
        w.ue(0); // bit depth luma
        w.ue(0); // bit depth chroma
        w.bit(0); // qpprime
        w.bit(0); // no scaling matrix
        w.ue(0);
        w.ue(2); // poc type 2
        w.ue(1);
        w.bit(0);
        w.ue(79); // 1280
        w.ue(44); // 720
        w.bit(1);
        w.bit(1);
        w.bit(0); // no cropping
        w.bit(0);
        let mut nal = vec![0x67];
        nal.extend(w.finish());

        let info = parse_sps(&nal).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
    }

    /// Baseline SPS up to the picture size fields, with the given size and cropping
    fn sps_with(width_mbs_minus1: u32, crop: [u32; 4]) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.bits(66, 8);
        w.bits(0, 8);
        w.bits(30, 8);
        w.ue(0);
        w.ue(0);
        w.ue(2); // poc type 2
        w.ue(1);
        w.bit(0);
        w.ue(width_mbs_minus1);
        w.ue(44);
        w.bit(1);
        w.bit(1);
        w.bit(1); // cropping
        for c in crop {
            w.ue(c);
        }
        w.bit(0);
        let mut nal = vec![0x67];
        nal.extend(w.finish());
        nal
    }

    #[test]
    fn test_oversized_fields_rejected() {
        assert_eq!(parse_sps(&sps_with(79, [0, 0, 0, 0])).map(|i| i.width), Some(1280));
        // 2^30 - 1 macroblocks wide
        assert!(parse_sps(&sps_with((1 << 30) - 2, [0, 0, 0, 0])).is_none());
        // Crop offsets whose sum overflows
        assert!(parse_sps(&sps_with(79, [u32::MAX - 1, u32::MAX - 1, 0, 0])).is_none());
    }

    #[test]
    fn test_scaling_list_with_huge_delta() {
        let mut w = BitWriter::new();
        w.bits(100, 8);
        w.bits(0, 8);
        w.bits(31, 8);
        w.ue(0); // sps id
        w.ue(1); // chroma_format_idc
        w.ue(0);
        w.ue(0);
        w.bit(0);
        w.bit(1); // scaling matrix present
        w.bit(1); // first list present
        // delta_scale of 2^31 - 8 wraps next_scale to 0, ending the list
        w.ue(4_294_967_279);
        w.bits(0, 7); // remaining lists absent
        w.ue(0);
        w.ue(2);
        w.ue(1);
        w.bit(0);
        w.ue(79);
        w.ue(44);
        w.bit(1);
        w.bit(1);
        w.bit(0);
        w.bit(0);
        let mut nal = vec![0x67];
        nal.extend(w.finish());

        let info = parse_sps(&nal).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
    }

    #[test]
    fn test_emulation_prevention_removed() {
        assert_eq!(to_rbsp(&[0x00, 0x00, 0x03, 0x01]), vec![0x00, 0x00, 0x01]);
        assert_eq!(to_rbsp(&[0x00, 0x03, 0x01]), vec![0x00, 0x03, 0x01]);
    }

    #[test]
    fn test_rejects_non_sps_and_truncated() {
        assert!(parse_sps(&[0x68, 0xCE, 0x3C, 0x80]).is_none());
        assert!(parse_sps(&[0x67, 0x42]).is_none());
        assert!(parse_sps(&[]).is_none());
    }
}
