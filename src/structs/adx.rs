//! ADX header, loop block and footer.
//!
//! The sample-level ADPCM transform lives outside this crate; what lives
//! here is the exact wire shape: the big-endian header starting `80 00`,
//! the version-4 history block, the optional loop block, the `(c)CRI`
//! trailer ending at `data_offset + 4`, and the `80 01` footer closing
//! the stream.

use crate::utils::bytes::{ByteReader, WriteBytesBe, pad_to};
use crate::utils::errors::{CriError, Result};

pub const ADX_MAGIC: u16 = 0x8000;
pub const ADX_FOOTER_MAGIC: u16 = 0x8001;
/// Base header size before history and loop blocks.
const BASE_HEADER: usize = 0x14;
const LOOP_BLOCK: usize = 24;

/// Loop block carried by looping version 3/4 streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdxLoop {
    pub alignment_samples: u16,
    pub loop_count: u16,
    pub loop_num: u16,
    pub loop_type: u16,
    pub start_sample: u32,
    pub start_byte: u32,
    pub end_sample: u32,
    pub end_byte: u32,
}

impl AdxLoop {
    pub fn enabled(&self) -> bool {
        self.loop_count == 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdxHeader {
    pub version: u8,
    pub encoding: u8,
    pub block_size: u8,
    pub bit_depth: u8,
    pub channels: u8,
    pub sample_rate: u32,
    pub sample_count: u32,
    pub highpass: u16,
    pub flags: u8,
    pub data_offset: u16,
    pub adx_loop: Option<AdxLoop>,
}

impl AdxHeader {
    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let magic = r.u16_be()?;
        if magic != ADX_MAGIC {
            return Err(CriError::InvalidMagic {
                expected: &[0x80, 0x00],
                actual: data.get(..2).unwrap_or_default().to_vec(),
            });
        }
        let data_offset = r.u16_be()?;
        let encoding = r.u8()?;
        let block_size = r.u8()?;
        let bit_depth = r.u8()?;
        let channels = r.u8()?;
        let sample_rate = r.u32_be()?;
        let sample_count = r.u32_be()?;
        let highpass = r.u16_be()?;
        let version = r.u8()?;
        let flags = r.u8()?;

        match encoding {
            0x10 | 0x11 => {
                return Err(CriError::unsupported("AHX (MPEG-2 audio) inside an ADX header"));
            }
            2 | 3 | 4 => {}
            other => {
                return Err(CriError::unsupported(format!("ADX encoding {other}")));
            }
        }
        if version == 6 {
            return Err(CriError::unsupported("ADX version 6"));
        }
        if !matches!(version, 3 | 4 | 5) {
            return Err(CriError::invalid(format!("ADX version {version}"), 0x12));
        }
        if bit_depth != 4 {
            return Err(CriError::unsupported(format!("ADX bit depth {bit_depth}")));
        }
        if flags == 8 || flags == 9 {
            return Err(CriError::unsupported("encrypted ADX/AHX (flags 8/9)"));
        }

        let mut header = Self {
            version,
            encoding,
            block_size,
            bit_depth,
            channels,
            sample_rate,
            sample_count,
            highpass,
            flags,
            data_offset,
            adx_loop: None,
        };
        if header.data_offset as usize + 4 < header.min_header_len() {
            return Err(CriError::invalid("ADX data offset below header minimum", 2));
        }

        if version == 4 {
            // Sample history block: one dword plus one per channel.
            r.skip(4 + 4 * channels as usize)?;
        }
        if version != 5 {
            let header_end = data_offset as usize - 2;
            if header_end >= r.pos() && header_end - r.pos() >= LOOP_BLOCK {
                header.adx_loop = Some(AdxLoop {
                    alignment_samples: r.u16_be()?,
                    loop_count: r.u16_be()?,
                    loop_num: r.u16_be()?,
                    loop_type: r.u16_be()?,
                    start_sample: r.u32_be()?,
                    start_byte: r.u32_be()?,
                    end_sample: r.u32_be()?,
                    end_byte: r.u32_be()?,
                });
            }
        }

        Ok(header)
    }

    /// Offset of the first sample block: past the `(c)CRI` trailer.
    pub fn body_offset(&self) -> usize {
        self.data_offset as usize + 4
    }

    /// Samples held by one block per channel.
    pub fn samples_per_block(&self) -> u32 {
        (u32::from(self.block_size) - 2) * 2
    }

    /// Bytes of one interleaved block row across all channels.
    pub fn frame_bytes(&self) -> usize {
        self.block_size as usize * self.channels as usize
    }

    fn min_header_len(&self) -> usize {
        let mut len = BASE_HEADER;
        if self.version == 4 {
            len += 4 + 4 * self.channels as usize;
        }
        if self.adx_loop.is_some() {
            len += LOOP_BLOCK;
        }
        len
    }

    /// Serializes the header including the `(c)CRI` trailer, ready for
    /// the sample body to follow at `data_offset + 4`.
    pub fn emit(&self) -> Result<Vec<u8>> {
        if self.version == 5 && self.adx_loop.is_some() {
            return Err(CriError::invalid("ADX version 5 cannot loop", 0));
        }
        let min = self.min_header_len() + 2;
        if (self.data_offset as usize + 4) < min + 4 {
            return Err(CriError::invalid(
                format!("ADX data offset {:#X} below minimum {min:#X}", self.data_offset),
                0,
            ));
        }
        if self.block_size < 3 || self.channels == 0 {
            return Err(CriError::invalid("ADX block size/channel constants", 0));
        }

        let mut out = Vec::with_capacity(self.body_offset());
        ADX_MAGIC.write_be(&mut out);
        self.data_offset.write_be(&mut out);
        self.encoding.write_be(&mut out);
        self.block_size.write_be(&mut out);
        self.bit_depth.write_be(&mut out);
        self.channels.write_be(&mut out);
        self.sample_rate.write_be(&mut out);
        self.sample_count.write_be(&mut out);
        self.highpass.write_be(&mut out);
        self.version.write_be(&mut out);
        self.flags.write_be(&mut out);
        if self.version == 4 {
            out.extend(std::iter::repeat_n(0u8, 4 + 4 * self.channels as usize));
        }
        if let Some(l) = &self.adx_loop {
            l.alignment_samples.write_be(&mut out);
            l.loop_count.write_be(&mut out);
            l.loop_num.write_be(&mut out);
            l.loop_type.write_be(&mut out);
            l.start_sample.write_be(&mut out);
            l.start_byte.write_be(&mut out);
            l.end_sample.write_be(&mut out);
            l.end_byte.write_be(&mut out);
        }
        pad_to(&mut out, self.data_offset as usize - 2);
        out.extend_from_slice(crate::structs::chunk::CRI_SIGNATURE);
        debug_assert_eq!(out.len(), self.body_offset());
        Ok(out)
    }

    /// The stream footer: `80 01`, padding length, then that much zero
    /// padding.
    pub fn emit_footer(&self) -> Vec<u8> {
        let pad = u16::from(self.block_size) - 4;
        let mut out = Vec::with_capacity(4 + pad as usize);
        ADX_FOOTER_MAGIC.write_be(&mut out);
        pad.write_be(&mut out);
        out.extend(std::iter::repeat_n(0u8, pad as usize));
        out
    }

    /// Footer length in bytes (`block_size` total).
    pub fn footer_len(&self) -> usize {
        self.block_size as usize
    }
}

/// Loop byte positions for a given sample range.
///
/// The start sample is rounded up to a whole sample pair boundary
/// (`(block_size-2)*2`); the rounding delta shifts both ends before the
/// byte positions are computed, all in integer arithmetic.
pub fn compute_loop(
    block_size: u8,
    channels: u8,
    data_offset: u16,
    start_sample: u32,
    end_sample: u32,
) -> AdxLoop {
    let b = u32::from(block_size);
    let c = u32::from(channels);
    let pair = (b - 2) * 2;
    let alignment_samples = ((pair - start_sample % pair) % pair) as u16;

    let start = start_sample + u32::from(alignment_samples);
    let end = end_sample + u32::from(alignment_samples);
    let byte_of = |sample: u32| -> u32 {
        let group = (b - 2) * c;
        (sample / group) * b * c + u32::from(data_offset) + 4 + (sample % group) * c
    };

    AdxLoop {
        alignment_samples,
        loop_count: 1,
        loop_num: 0,
        loop_type: 1,
        start_sample: start,
        start_byte: byte_of(start),
        end_sample: end,
        end_byte: byte_of(end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(version: u8, adx_loop: Option<AdxLoop>) -> AdxHeader {
        // Non-looping offsets deliberately leave less than a loop block of
        // slack so the parser cannot see a phantom loop.
        let data_offset = match (version, &adx_loop) {
            (3, None) => 0x18,
            (3, Some(_)) => 0x30,
            (4 | 5, None) => 0x24,
            (4, Some(_)) => 0x40,
            _ => 0x24,
        };
        AdxHeader {
            version,
            encoding: 3,
            block_size: 0x12,
            bit_depth: 4,
            channels: 2,
            sample_rate: 48000,
            sample_count: 0x1234,
            highpass: 0x1F4,
            flags: 0,
            data_offset,
            adx_loop,
        }
    }

    #[test]
    fn header_reflexive_all_variants() {
        for version in [3u8, 4, 5] {
            let mut cases = vec![None];
            if version != 5 {
                let data_offset = if version == 3 { 0x30 } else { 0x40 };
                cases.push(Some(compute_loop(0x12, 2, data_offset, 0x40, 0x4000)));
            }
            for adx_loop in cases {
                let header = params(version, adx_loop);
                let raw = header.emit().unwrap();
                let parsed = AdxHeader::parse(&raw).unwrap();
                assert_eq!(parsed, header, "version {version}");
            }
        }
    }

    #[test]
    fn trailer_sits_before_body() {
        let header = params(4, None);
        let raw = header.emit().unwrap();
        assert_eq!(&raw[header.data_offset as usize - 2..], b"(c)CRI");
        assert_eq!(raw.len(), header.body_offset());
    }

    #[test]
    fn loop_bytes_integer_math() {
        // Aligned start sample: no alignment shift, even byte offset.
        let l = compute_loop(0x12, 2, 0x120, 0x100, 0x300);
        assert_eq!(l.alignment_samples, 0);
        assert_eq!(l.start_byte % 2, 0);
        assert_eq!(l.start_byte, (0x100 / 32) * 36 + 0x120 + 4);

        // Unaligned start rounds up and shifts both ends.
        let l = compute_loop(0x12, 2, 0x120, 0x101, 0x300);
        assert_eq!(u32::from(l.alignment_samples), 32 - 1);
        assert_eq!(l.start_sample % 32, 0);
        assert_eq!(l.end_sample, 0x300 + 31);
    }

    #[test]
    fn footer_shape() {
        let header = params(3, None);
        let footer = header.emit_footer();
        assert_eq!(footer.len(), header.footer_len());
        assert_eq!(&footer[..4], &[0x80, 0x01, 0x00, 0x0E]);
        assert!(footer[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejections() {
        let mut raw = params(3, None).emit().unwrap();
        raw[4] = 0x10; // AHX encoding
        assert!(matches!(
            AdxHeader::parse(&raw),
            Err(CriError::UnsupportedFormat { .. })
        ));

        let mut raw = params(3, None).emit().unwrap();
        raw[0x13] = 9; // encrypted flags
        assert!(matches!(
            AdxHeader::parse(&raw),
            Err(CriError::UnsupportedFormat { .. })
        ));

        let mut raw = params(3, None).emit().unwrap();
        raw[6] = 8; // bit depth
        assert!(AdxHeader::parse(&raw).is_err());
    }
}
