//! IVF (DKIF) container reader for the VP9 streams a USM build consumes.
//!
//! Frames are yielded together with their 12-byte `(size, timestamp)`
//! headers because the USM packetizer ships them verbatim. Keyframes are
//! detected from the VP9 uncompressed-header bits.

use crate::structs::chunk::IVF_MAGIC;
use crate::utils::bytes::ByteReader;
use crate::utils::errors::{CriError, Result};

#[derive(Debug, Clone)]
pub struct Ivf {
    pub version: u16,
    pub header_size: u16,
    pub width: u16,
    pub height: u16,
    pub time_base_denominator: u32,
    pub time_base_numerator: u32,
    pub frame_count: u32,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct IvfFrame<'a> {
    /// Frame header plus payload, as stored.
    pub data: &'a [u8],
    pub timestamp: u64,
    pub index: u32,
    pub keyframe: bool,
}

impl Ivf {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        r.expect_magic(IVF_MAGIC)?;
        let version = r.u16_le()?;
        let header_size = r.u16_le()?;
        let codec = r.take(4)?;
        if codec != b"VP90" {
            return Err(CriError::unsupported(format!(
                "IVF codec {:?} (USM video must be VP9)",
                String::from_utf8_lossy(codec)
            )));
        }
        let width = r.u16_le()?;
        let height = r.u16_le()?;
        let time_base_denominator = r.u32_le()?;
        let time_base_numerator = r.u32_le()?;
        let frame_count = r.u32_le()?;
        if time_base_numerator == 0 {
            return Err(CriError::invalid("IVF time base numerator of zero", 0x14));
        }
        if (header_size as usize) > data.len() {
            return Err(CriError::invalid("IVF header size past input", 6));
        }

        Ok(Self {
            version,
            header_size,
            width,
            height,
            time_base_denominator,
            time_base_numerator,
            frame_count,
            data: data.to_vec(),
        })
    }

    /// The stream header, re-emitted in front of the first video packet
    /// of a USM.
    pub fn header(&self) -> &[u8] {
        &self.data[..self.header_size as usize]
    }

    /// Frames per second as the container declares it.
    pub fn fps(&self) -> f64 {
        f64::from(self.time_base_denominator) / f64::from(self.time_base_numerator)
    }

    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    /// Restartable frame cursor.
    pub fn frames(&self) -> IvfFrames<'_> {
        IvfFrames {
            ivf: self,
            offset: self.header_size as usize,
            index: 0,
        }
    }
}

pub struct IvfFrames<'a> {
    ivf: &'a Ivf,
    offset: usize,
    index: u32,
}

impl<'a> Iterator for IvfFrames<'a> {
    type Item = Result<IvfFrame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.ivf.frame_count {
            return None;
        }
        let data = &self.ivf.data;
        if self.offset + 12 > data.len() {
            return Some(Err(CriError::invalid(
                "IVF frame header past end of input",
                self.offset,
            )));
        }
        let size = u32::from_le_bytes(data[self.offset..self.offset + 4].try_into().unwrap())
            as usize;
        let timestamp =
            u64::from_le_bytes(data[self.offset + 4..self.offset + 12].try_into().unwrap());
        let total = 12 + size;
        if self.offset + total > data.len() {
            return Some(Err(CriError::invalid(
                "IVF frame payload past end of input",
                self.offset,
            )));
        }

        let frame = IvfFrame {
            data: &data[self.offset..self.offset + total],
            timestamp,
            index: self.index,
            keyframe: vp9_is_keyframe(&data[self.offset + 12..self.offset + total]),
        };
        self.offset += total;
        self.index += 1;
        Some(Ok(frame))
    }
}

/// Reads the first bits of a VP9 uncompressed header: frame marker (2),
/// profile (2, low then high), show_existing_frame (1), frame_type (1,
/// zero for a keyframe).
fn vp9_is_keyframe(payload: &[u8]) -> bool {
    let Some(&b0) = payload.first() else {
        return false;
    };
    if b0 >> 6 != 0b10 {
        return false;
    }
    let profile = (b0 >> 5) & 1 | ((b0 >> 4) & 1) << 1;
    let mut bit = 4u8;
    if profile == 3 {
        // Reserved bit before show_existing_frame.
        bit -= 1;
    }
    let show_existing = (b0 >> (bit - 1)) & 1;
    if show_existing == 1 {
        return false;
    }
    let frame_type = (b0 >> (bit - 2)) & 1;
    frame_type == 0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::bytes::WriteBytesLe;

    pub(crate) fn build_ivf(frames: &[(&[u8], u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"DKIF");
        0u16.write_le(&mut out);
        32u16.write_le(&mut out);
        out.extend_from_slice(b"VP90");
        640u16.write_le(&mut out);
        360u16.write_le(&mut out);
        30000u32.write_le(&mut out);
        1001u32.write_le(&mut out);
        (frames.len() as u32).write_le(&mut out);
        0u32.write_le(&mut out);
        for (payload, ts) in frames {
            (payload.len() as u32).write_le(&mut out);
            ts.write_le(&mut out);
            out.extend_from_slice(payload);
        }
        out
    }

    // Profile-0 VP9 first bytes: keyframe (frame_type 0) and interframe.
    pub(crate) const VP9_KEY: &[u8] = &[0x82, 0x49, 0x83, 0x42, 0x00];
    pub(crate) const VP9_INTER: &[u8] = &[0x86, 0x00, 0x12, 0x34, 0x56];

    #[test]
    fn header_and_frames() {
        let raw = build_ivf(&[(VP9_KEY, 0), (VP9_INTER, 1), (VP9_INTER, 2)]);
        let ivf = Ivf::parse(&raw).unwrap();
        assert_eq!(ivf.frame_count, 3);
        assert!((ivf.fps() - 29.97).abs() < 0.01);

        let frames: Vec<_> = ivf.frames().collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data.len(), 12 + VP9_KEY.len());
        assert!(frames[0].keyframe);
        assert!(!frames[1].keyframe);
        assert_eq!(frames[2].timestamp, 2);
        // Restartable cursor.
        assert_eq!(ivf.frames().count(), 3);
    }

    #[test]
    fn non_vp9_rejected() {
        let mut raw = build_ivf(&[(VP9_KEY, 0)]);
        raw[8..12].copy_from_slice(b"AV01");
        assert!(matches!(
            Ivf::parse(&raw),
            Err(CriError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_error() {
        let mut raw = build_ivf(&[(VP9_KEY, 0)]);
        raw.truncate(raw.len() - 2);
        let ivf = Ivf::parse(&raw).unwrap();
        assert!(ivf.frames().next().unwrap().is_err());
    }
}
