//! HCA header codec and cipher.
//!
//! An HCA file is a chain of tagged subchunks (`fmt`, `comp`/`dec`,
//! `loop`, `ciph`, `ath`, `vbr`, `rva`, `pad`) closed by a big-endian
//! CRC-16 (0x8005), followed by fixed-size frames that each carry their
//! own trailing CRC-16. Encrypted-looking files set the high bit of
//! every tag byte; that affects the written tags only, never the data.
//!
//! Frame bodies are scrambled by a 256-entry substitution table: type 1
//! is static, type 56 is derived from a 64-bit key (optionally folded
//! with a 16-bit subkey). The MDCT sample pipeline is out of scope.

use crate::utils::bytes::{ByteReader, WriteBytesBe, pad_to};
use crate::utils::crc::{CRC_16_UMD, Crc16};
use crate::utils::errors::{CriError, Result};

/// Key applied when an encrypted-look file is decrypted without one.
pub const DEFAULT_HCA_KEY: u64 = 0xCF22_2F1F_E074_8978;

const TAG_HCA: [u8; 4] = *b"HCA\0";
const TAG_FMT: [u8; 4] = *b"fmt\0";
const TAG_COMP: [u8; 4] = *b"comp";
const TAG_DEC: [u8; 4] = *b"dec\0";
const TAG_LOOP: [u8; 4] = *b"loop";
const TAG_CIPH: [u8; 4] = *b"ciph";
const TAG_ATH: [u8; 4] = *b"ath\0";
const TAG_VBR: [u8; 4] = *b"vbr\0";
const TAG_RVA: [u8; 4] = *b"rva\0";
const TAG_PAD: [u8; 4] = *b"pad\0";

fn strip(tag: [u8; 4]) -> [u8; 4] {
    [
        tag[0] & 0x7F,
        tag[1] & 0x7F,
        tag[2] & 0x7F,
        tag[3] & 0x7F,
    ]
}

fn mask(tag: [u8; 4]) -> [u8; 4] {
    let m = |b: u8| if b == 0 { 0 } else { b | 0x80 };
    [m(tag[0]), m(tag[1]), m(tag[2]), m(tag[3])]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherType {
    /// Plain frames.
    None,
    /// Static keyless table.
    Static,
    /// Keyed 56-bit table.
    Keyed,
}

impl CipherType {
    pub fn from_u16(value: u16, offset: usize) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Static),
            56 => Ok(Self::Keyed),
            other => Err(CriError::invalid(
                format!("HCA cipher type {other}"),
                offset,
            )),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Static => 1,
            Self::Keyed => 56,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcaFmt {
    pub channels: u8,
    pub sample_rate: u32,
    pub frame_count: u32,
    pub encoder_delay: u16,
    pub encoder_padding: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcaComp {
    pub frame_size: u16,
    pub min_resolution: u8,
    pub max_resolution: u8,
    pub track_count: u8,
    pub channel_config: u8,
    pub total_band_count: u8,
    pub base_band_count: u8,
    pub stereo_band_count: u8,
    pub bands_per_hfr_group: u8,
    pub ms_stereo: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcaDec {
    pub frame_size: u16,
    pub min_resolution: u8,
    pub max_resolution: u8,
    pub total_band_count: u8,
    pub base_band_count: u8,
    pub track_count: u8,
    pub channel_config: u8,
    pub stereo_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcaLoop {
    pub start_frame: u32,
    pub end_frame: u32,
    pub pre_samples: u16,
    pub post_samples: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcaVbr {
    pub max_frame_size: u16,
    pub noise_level: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HcaRva {
    pub volume: f32,
}

/// Logical header contents, independent of tag masking and padding.
#[derive(Debug, Clone, PartialEq)]
pub struct HcaInfo {
    pub version: u16,
    pub header_size: u16,
    pub fmt: HcaFmt,
    pub comp: Option<HcaComp>,
    pub dec: Option<HcaDec>,
    pub hca_loop: Option<HcaLoop>,
    pub ath_type: Option<u16>,
    pub vbr: Option<HcaVbr>,
    pub rva: Option<HcaRva>,
    pub cipher: CipherType,
}

impl HcaInfo {
    pub fn frame_size(&self) -> Result<u16> {
        self.comp
            .map(|c| c.frame_size)
            .or(self.dec.map(|d| d.frame_size))
            .filter(|&fs| fs > 2)
            .ok_or_else(|| CriError::invalid("HCA without a usable frame size", 0))
    }

    /// Serializes the header: chained subchunks, `pad` filler up to the
    /// header size, trailing CRC-16. High-bit tags when `masked`.
    pub fn emit_header(&self, masked: bool) -> Result<Vec<u8>> {
        let tag = |t: [u8; 4]| if masked { mask(t) } else { t };

        let mut out = Vec::with_capacity(self.header_size as usize);
        out.extend_from_slice(&tag(TAG_HCA));
        self.version.write_be(&mut out);
        self.header_size.write_be(&mut out);

        out.extend_from_slice(&tag(TAG_FMT));
        out.push(self.fmt.channels);
        out.extend_from_slice(&self.fmt.sample_rate.to_be_bytes()[1..]);
        self.fmt.frame_count.write_be(&mut out);
        self.fmt.encoder_delay.write_be(&mut out);
        self.fmt.encoder_padding.write_be(&mut out);

        if let Some(c) = &self.comp {
            out.extend_from_slice(&tag(TAG_COMP));
            c.frame_size.write_be(&mut out);
            out.extend_from_slice(&[
                c.min_resolution,
                c.max_resolution,
                c.track_count,
                c.channel_config,
                c.total_band_count,
                c.base_band_count,
                c.stereo_band_count,
                c.bands_per_hfr_group,
                c.ms_stereo,
                0,
            ]);
        }
        if let Some(d) = &self.dec {
            out.extend_from_slice(&tag(TAG_DEC));
            d.frame_size.write_be(&mut out);
            out.extend_from_slice(&[
                d.min_resolution,
                d.max_resolution,
                d.total_band_count,
                d.base_band_count,
                d.track_count << 4 | (d.channel_config & 0xF),
                d.stereo_type,
            ]);
        }
        if let Some(l) = &self.hca_loop {
            out.extend_from_slice(&tag(TAG_LOOP));
            l.start_frame.write_be(&mut out);
            l.end_frame.write_be(&mut out);
            l.pre_samples.write_be(&mut out);
            l.post_samples.write_be(&mut out);
        }
        out.extend_from_slice(&tag(TAG_CIPH));
        self.cipher.as_u16().write_be(&mut out);
        if let Some(a) = self.ath_type {
            out.extend_from_slice(&tag(TAG_ATH));
            a.write_be(&mut out);
        }
        if let Some(v) = &self.vbr {
            out.extend_from_slice(&tag(TAG_VBR));
            v.max_frame_size.write_be(&mut out);
            v.noise_level.write_be(&mut out);
        }
        if let Some(r) = &self.rva {
            out.extend_from_slice(&tag(TAG_RVA));
            r.volume.write_be(&mut out);
        }

        let body_end = self.header_size as usize - 2;
        if out.len() > body_end {
            return Err(CriError::invalid(
                format!("HCA subchunks overflow header size {:#X}", self.header_size),
                out.len(),
            ));
        }
        if body_end - out.len() >= 4 {
            out.extend_from_slice(&tag(TAG_PAD));
        }
        pad_to(&mut out, body_end);

        let crc = Crc16::new(&CRC_16_UMD).checksum(&out);
        crc.write_be(&mut out);
        Ok(out)
    }
}

/// A parsed HCA file: logical header plus the frame region.
#[derive(Debug, Clone)]
pub struct Hca {
    pub info: HcaInfo,
    /// Tags were stored with the high bit set.
    pub masked_tags: bool,
    data: Vec<u8>,
}

impl Hca {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let raw_tag: [u8; 4] = data
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| CriError::invalid("HCA input shorter than a tag", 0))?;
        if strip(raw_tag) != TAG_HCA {
            return Err(CriError::InvalidMagic {
                expected: b"HCA\0",
                actual: raw_tag.to_vec(),
            });
        }
        let masked_tags = raw_tag != TAG_HCA;
        r.skip(4)?;
        let version = r.u16_be()?;
        let header_size = r.u16_be()?;
        if (header_size as usize) < 10 || header_size as usize > data.len() {
            return Err(CriError::invalid("HCA header size out of range", 6));
        }
        let body_end = header_size as usize - 2;

        let mut info = HcaInfo {
            version,
            header_size,
            fmt: HcaFmt {
                channels: 0,
                sample_rate: 0,
                frame_count: 0,
                encoder_delay: 0,
                encoder_padding: 0,
            },
            comp: None,
            dec: None,
            hca_loop: None,
            ath_type: None,
            vbr: None,
            rva: None,
            cipher: CipherType::None,
        };
        let mut have_fmt = false;

        while r.pos() + 4 <= body_end {
            let tag_pos = r.pos();
            let raw: [u8; 4] = data[tag_pos..tag_pos + 4].try_into().expect("peeked tag");
            match strip(raw) {
                TAG_FMT => {
                    r.skip(4)?;
                    info.fmt = HcaFmt {
                        channels: r.u8()?,
                        sample_rate: r.u24_be()?,
                        frame_count: r.u32_be()?,
                        encoder_delay: r.u16_be()?,
                        encoder_padding: r.u16_be()?,
                    };
                    have_fmt = true;
                }
                TAG_COMP => {
                    r.skip(4)?;
                    info.comp = Some(HcaComp {
                        frame_size: r.u16_be()?,
                        min_resolution: r.u8()?,
                        max_resolution: r.u8()?,
                        track_count: r.u8()?,
                        channel_config: r.u8()?,
                        total_band_count: r.u8()?,
                        base_band_count: r.u8()?,
                        stereo_band_count: r.u8()?,
                        bands_per_hfr_group: r.u8()?,
                        ms_stereo: r.u8()?,
                    });
                    r.skip(1)?;
                }
                TAG_DEC => {
                    r.skip(4)?;
                    let frame_size = r.u16_be()?;
                    let min_resolution = r.u8()?;
                    let max_resolution = r.u8()?;
                    let total_band_count = r.u8()?;
                    let base_band_count = r.u8()?;
                    let packed = r.u8()?;
                    info.dec = Some(HcaDec {
                        frame_size,
                        min_resolution,
                        max_resolution,
                        total_band_count,
                        base_band_count,
                        track_count: packed >> 4,
                        channel_config: packed & 0xF,
                        stereo_type: r.u8()?,
                    });
                }
                TAG_LOOP => {
                    r.skip(4)?;
                    info.hca_loop = Some(HcaLoop {
                        start_frame: r.u32_be()?,
                        end_frame: r.u32_be()?,
                        pre_samples: r.u16_be()?,
                        post_samples: r.u16_be()?,
                    });
                }
                TAG_CIPH => {
                    r.skip(4)?;
                    let pos = r.pos();
                    info.cipher = CipherType::from_u16(r.u16_be()?, pos)?;
                }
                TAG_ATH => {
                    r.skip(4)?;
                    info.ath_type = Some(r.u16_be()?);
                }
                TAG_VBR => {
                    r.skip(4)?;
                    info.vbr = Some(HcaVbr {
                        max_frame_size: r.u16_be()?,
                        noise_level: r.u16_be()?,
                    });
                }
                TAG_RVA => {
                    r.skip(4)?;
                    info.rva = Some(HcaRva {
                        volume: r.f32_be()?,
                    });
                }
                TAG_PAD => break,
                _ => break,
            }
        }

        let crc = Crc16::new(&CRC_16_UMD);
        let stored = u16::from_be_bytes([data[body_end], data[body_end + 1]]);
        if crc.checksum(&data[..body_end]) != stored {
            return Err(CriError::invalid("HCA header CRC mismatch", body_end));
        }
        if !have_fmt {
            return Err(CriError::invalid("HCA missing fmt subchunk", 8));
        }

        let frame_size = info.frame_size()? as usize;
        let frames_len = frame_size
            .checked_mul(info.fmt.frame_count as usize)
            .ok_or_else(|| CriError::invalid("HCA frame region overflow", 8))?;
        if header_size as usize + frames_len > data.len() {
            return Err(CriError::invalid(
                "HCA frame region past end of input",
                header_size as usize,
            ));
        }

        Ok(Self {
            info,
            masked_tags,
            data: data.to_vec(),
        })
    }

    pub fn channels(&self) -> u8 {
        self.info.fmt.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.info.fmt.sample_rate
    }

    pub fn frame_count(&self) -> u32 {
        self.info.fmt.frame_count
    }

    pub fn frame_size(&self) -> u16 {
        self.info.frame_size().expect("validated at parse")
    }

    /// Raw header bytes, as the USM packetizer ships them.
    pub fn header(&self) -> &[u8] {
        &self.data[..self.info.header_size as usize]
    }

    /// Restartable cursor over the frames.
    pub fn frames(&self) -> HcaFrames<'_> {
        HcaFrames {
            data: &self.data,
            offset: self.info.header_size as usize,
            frame_size: self.frame_size() as usize,
            remaining: self.info.fmt.frame_count as usize,
        }
    }

    /// Produces plain-frame bytes: cipher table applied to every frame
    /// body, CRCs recomputed, `ciph` type 0, plain tags.
    pub fn decrypt(&self, key: u64, subkey: u16) -> Result<Vec<u8>> {
        let table = match self.info.cipher {
            CipherType::None => {
                return Err(CriError::refused("HCA is not encrypted"));
            }
            CipherType::Static => cipher_table_static(),
            CipherType::Keyed => {
                let key = if key == 0 { DEFAULT_HCA_KEY } else { key };
                cipher_table_keyed(key, subkey)
            }
        };
        self.rebuild(CipherType::None, false, &table)
    }

    /// Produces encrypted-frame bytes using the inverse table, `ciph`
    /// set to the requested type, high-bit tags.
    pub fn encrypt(&self, cipher: CipherType, key: u64, subkey: u16) -> Result<Vec<u8>> {
        if self.info.cipher != CipherType::None {
            return Err(CriError::refused("HCA is already encrypted"));
        }
        let table = match cipher {
            CipherType::None => {
                return Err(CriError::refused("encrypt to cipher type 0"));
            }
            CipherType::Static => invert_table(&cipher_table_static()),
            CipherType::Keyed => invert_table(&cipher_table_keyed(key, subkey)),
        };
        self.rebuild(cipher, true, &table)
    }

    fn rebuild(&self, cipher: CipherType, masked: bool, table: &[u8; 256]) -> Result<Vec<u8>> {
        let mut info = self.info.clone();
        info.cipher = cipher;
        let mut out = info.emit_header(masked)?;

        let crc = Crc16::new(&CRC_16_UMD);
        let frame_size = self.frame_size() as usize;
        for frame in self.frames() {
            let mut frame = frame.to_vec();
            for b in &mut frame[..frame_size - 2] {
                *b = table[*b as usize];
            }
            let sum = crc.checksum(&frame[..frame_size - 2]);
            frame[frame_size - 2..].copy_from_slice(&sum.to_be_bytes());
            out.extend_from_slice(&frame);
        }
        Ok(out)
    }
}

pub struct HcaFrames<'a> {
    data: &'a [u8],
    offset: usize,
    frame_size: usize,
    remaining: usize,
}

impl<'a> Iterator for HcaFrames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.offset + self.frame_size > self.data.len() {
            return None;
        }
        let frame = &self.data[self.offset..self.offset + self.frame_size];
        self.offset += self.frame_size;
        self.remaining -= 1;
        Some(frame)
    }
}

/// Static (type 1) substitution table.
pub fn cipher_table_static() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut v: u8 = 0;
    for entry in table.iter_mut().take(0xFF).skip(1) {
        v = v.wrapping_mul(13).wrapping_add(11);
        if v == 0 || v == 0xFF {
            v = v.wrapping_mul(13).wrapping_add(11);
        }
        *entry = v;
    }
    table[0] = 0;
    table[0xFF] = 0xFF;
    table
}

/// Keyed (type 56) substitution table.
pub fn cipher_table_keyed(key: u64, subkey: u16) -> [u8; 256] {
    let key = if subkey != 0 {
        let fold = (u64::from(subkey) << 16) | u64::from((!subkey).wrapping_add(2));
        key.wrapping_mul(fold)
    } else {
        key
    };

    let mut kc = [0u8; 7];
    for (i, b) in kc.iter_mut().enumerate() {
        *b = (key >> (8 * i)) as u8;
    }
    let seeds = [
        kc[1],
        kc[1] ^ kc[6],
        kc[2] ^ kc[3],
        kc[2],
        kc[2] ^ kc[1],
        kc[3] ^ kc[4],
        kc[3],
        kc[3] ^ kc[2],
        kc[4] ^ kc[5],
        kc[4],
        kc[4] ^ kc[3],
        kc[5] ^ kc[6],
        kc[5],
        kc[5] ^ kc[4],
        kc[6] ^ kc[1],
        kc[6],
    ];

    let row = nibble_cycle(kc[0]);
    let mut base = [0u8; 256];
    for r in 0..16 {
        let col = nibble_cycle(seeds[r]);
        for c in 0..16 {
            base[r * 16 + c] = (row[r] << 4) | col[c];
        }
    }

    let mut table = [0u8; 256];
    let mut pos = 1;
    let mut x: u8 = 0;
    for _ in 0..256 {
        x = x.wrapping_add(17);
        let v = base[x as usize];
        if v != 0 && v != 0xFF && pos < 0xFF {
            table[pos] = v;
            pos += 1;
        }
    }
    table[0] = 0;
    table[0xFF] = 0xFF;
    table
}

/// 16 nibbles from the full-period affine walk seeded by `seed`.
fn nibble_cycle(seed: u8) -> [u8; 16] {
    let mul = ((seed & 1) << 3) | 5;
    let add = (seed & 0xE) | 1;
    let mut v = seed >> 4;
    let mut out = [0u8; 16];
    for entry in &mut out {
        v = v.wrapping_mul(mul).wrapping_add(add) & 0xF;
        *entry = v;
    }
    out
}

/// Inverse permutation: the encrypt table for a given decrypt table.
pub fn invert_table(table: &[u8; 256]) -> [u8; 256] {
    let mut inv = [0u8; 256];
    for (i, &v) in table.iter().enumerate() {
        inv[v as usize] = i as u8;
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(cipher: CipherType) -> HcaInfo {
        HcaInfo {
            version: 0x0200,
            header_size: 0x60,
            fmt: HcaFmt {
                channels: 2,
                sample_rate: 48000,
                frame_count: 4,
                encoder_delay: 0x80,
                encoder_padding: 0xE2,
            },
            comp: Some(HcaComp {
                frame_size: 0x40,
                min_resolution: 1,
                max_resolution: 15,
                track_count: 0,
                channel_config: 0,
                total_band_count: 0x80,
                base_band_count: 0x60,
                stereo_band_count: 0x20,
                bands_per_hfr_group: 0,
                ms_stereo: 0,
            }),
            dec: None,
            hca_loop: Some(HcaLoop {
                start_frame: 1,
                end_frame: 3,
                pre_samples: 0x80,
                post_samples: 0x100,
            }),
            ath_type: Some(0),
            vbr: None,
            rva: Some(HcaRva { volume: 1.0 }),
            cipher,
        }
    }

    fn sample_file(cipher: CipherType) -> Vec<u8> {
        let info = sample_info(cipher);
        let mut out = info.emit_header(false).unwrap();
        let crc = Crc16::new(&CRC_16_UMD);
        for f in 0u8..4 {
            let mut frame = vec![f.wrapping_mul(37); 0x40];
            let sum = crc.checksum(&frame[..0x3E]);
            frame[0x3E..].copy_from_slice(&sum.to_be_bytes());
            out.extend_from_slice(&frame);
        }
        out
    }

    #[test]
    fn static_table_recurrence() {
        let t = cipher_table_static();
        assert_eq!(&t[..5], &[0x00, 0x0B, 0x9A, 0xDD, 0x44]);
        assert_eq!(t[0xFF], 0xFF);

        let mut seen = [false; 256];
        for &v in &t {
            seen[v as usize] = true;
        }
        assert!(seen.iter().all(|&s| s), "static table is a permutation");
    }

    #[test]
    fn keyed_table_is_inverse_permutation() {
        for (key, subkey) in [
            (DEFAULT_HCA_KEY, 0u16),
            (0x0030_D9E8_DF54_0000, 0),
            (1, 0xABCD),
            (0xFFFF_FFFF_FFFF_FFFF, 1),
        ] {
            let t = cipher_table_keyed(key, subkey);
            assert_eq!(t[0], 0);
            assert_eq!(t[0xFF], 0xFF);

            let inv = invert_table(&t);
            for b in 0..=255u8 {
                assert_eq!(inv[t[b as usize] as usize], b);
            }
            let mut seen = [false; 256];
            for &v in &t {
                seen[v as usize] = true;
            }
            assert!(seen.iter().all(|&s| s), "table for {key:#X} is a permutation");
        }
    }

    #[test]
    fn header_parses_back() {
        let raw = sample_file(CipherType::None);
        let hca = Hca::parse(&raw).unwrap();
        assert_eq!(hca.info, sample_info(CipherType::None));
        assert!(!hca.masked_tags);
        assert_eq!(hca.frames().count(), 4);
        assert_eq!(hca.frame_size(), 0x40);
    }

    #[test]
    fn crypt_roundtrip_restores_frames() {
        let plain = sample_file(CipherType::None);
        let hca = Hca::parse(&plain).unwrap();

        let encrypted = hca.encrypt(CipherType::Keyed, 0x1234_5678, 0).unwrap();
        let parsed = Hca::parse(&encrypted).unwrap();
        assert!(parsed.masked_tags);
        assert_eq!(parsed.info.cipher, CipherType::Keyed);

        // Every frame CRC must hold after the rewrite.
        let crc = Crc16::new(&CRC_16_UMD);
        for frame in parsed.frames() {
            let sum = u16::from_be_bytes([frame[0x3E], frame[0x3F]]);
            assert_eq!(crc.checksum(&frame[..0x3E]), sum);
        }

        let decrypted = parsed.decrypt(0x1234_5678, 0).unwrap();
        let restored = Hca::parse(&decrypted).unwrap();
        let frames: Vec<_> = restored.frames().collect();
        let original: Vec<_> = hca.frames().collect();
        assert_eq!(frames, original);
    }

    #[test]
    fn masked_magic_detected() {
        let plain = sample_file(CipherType::None);
        let hca = Hca::parse(&plain).unwrap();
        let encrypted = hca.encrypt(CipherType::Static, 0, 0).unwrap();
        assert_eq!(&encrypted[..4], &[0xC8, 0xC3, 0xC1, 0x00]);
    }

    #[test]
    fn cipher_refusals() {
        let plain = Hca::parse(&sample_file(CipherType::None)).unwrap();
        assert!(matches!(
            plain.decrypt(0, 0),
            Err(CriError::CipherRefused { .. })
        ));

        let encrypted = plain.encrypt(CipherType::Static, 0, 0).unwrap();
        let encrypted = Hca::parse(&encrypted).unwrap();
        assert!(matches!(
            encrypted.encrypt(CipherType::Static, 0, 0),
            Err(CriError::CipherRefused { .. })
        ));
    }

    #[test]
    fn header_crc_validated() {
        let mut raw = sample_file(CipherType::None);
        raw[0x10] ^= 0xFF;
        assert!(matches!(Hca::parse(&raw), Err(CriError::InvalidData { .. })));
    }

    #[test]
    fn subkey_changes_table() {
        let a = cipher_table_keyed(DEFAULT_HCA_KEY, 0);
        let b = cipher_table_keyed(DEFAULT_HCA_KEY, 0x1357);
        assert_ne!(a, b);
    }
}
