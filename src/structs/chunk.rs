//! Chunk magics and the fixed chunk headers shared by CPK and USM.
//!
//! CPK wraps each of its tables in a 16-byte little-endian chunk header;
//! USM frames everything in 0x20-byte big-endian packet headers. Both are
//! defined here so the archive and stream layers agree on the framing.

use crate::utils::bytes::{ByteReader, WriteBytesBe, WriteBytesLe};
use crate::utils::errors::{CriError, Result};

pub const UTF_MAGIC: &[u8; 4] = b"@UTF";
/// `@UTF` after the whole-table XOR keystream has been applied.
pub const UTF_ENCRYPTED_MAGIC: &[u8; 4] = &[0x1F, 0x9E, 0xF3, 0xF5];

pub const AFS2_MAGIC: &[u8; 4] = b"AFS2";
pub const CRILAYLA_MAGIC: &[u8; 8] = b"CRILAYLA";
pub const IVF_MAGIC: &[u8; 4] = b"DKIF";

pub const HCA_MAGIC: &[u8; 4] = b"HCA\0";

pub const CPK_MAGIC: &[u8; 4] = b"CPK ";
pub const TOC_MAGIC: &[u8; 4] = b"TOC ";
pub const ITOC_MAGIC: &[u8; 4] = b"ITOC";
pub const ETOC_MAGIC: &[u8; 4] = b"ETOC";
pub const GTOC_MAGIC: &[u8; 4] = b"GTOC";

/// Signature written into the padding tail of the CpkHeader region and at
/// the end of every ADX header.
pub const CRI_SIGNATURE: &[u8; 6] = b"(c)CRI";

pub const CRID_MAGIC: &[u8; 4] = b"CRID";
pub const SFV_MAGIC: &[u8; 4] = b"@SFV";
pub const SFA_MAGIC: &[u8; 4] = b"@SFA";
pub const ALP_MAGIC: &[u8; 4] = b"@ALP";
pub const SBT_MAGIC: &[u8; 4] = b"@SBT";
pub const CUE_MAGIC: &[u8; 4] = b"@CUE";

/// Payload magics a USM stream may declare.
pub const USM_STREAM_MAGICS: &[&[u8; 4]] = &[
    SFV_MAGIC,
    SFA_MAGIC,
    ALP_MAGIC,
    SBT_MAGIC,
    CUE_MAGIC,
    b"@AHX",
    b"@USR",
    b"@PST",
];

/// 16-byte header wrapping the CPK file itself and each sibling table.
///
/// Little-endian: magic, flag, packet size (length of the enclosed @UTF
/// blob), reserved zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpkChunkHeader {
    pub magic: [u8; 4],
    pub flag: u32,
    pub packet_size: u32,
}

impl CpkChunkHeader {
    pub const SIZE: usize = 16;

    pub fn read(r: &mut ByteReader) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(r.take(4)?);
        let flag = r.u32_le()?;
        let packet_size = r.u32_le()?;
        r.skip(4)?;
        Ok(Self {
            magic,
            flag,
            packet_size,
        })
    }

    pub fn emit(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.magic);
        self.flag.write_le(dst);
        self.packet_size.write_le(dst);
        0u32.write_le(dst);
    }
}

/// The kind byte of a USM packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Payload,
    HeaderInfo,
    SectionEnd,
    Metadata,
}

impl PacketKind {
    pub fn from_u8(value: u8, offset: usize) -> Result<Self> {
        match value {
            0 => Ok(Self::Payload),
            1 => Ok(Self::HeaderInfo),
            2 => Ok(Self::SectionEnd),
            3 => Ok(Self::Metadata),
            other => Err(CriError::invalid(
                format!("unknown USM packet kind {other}"),
                offset,
            )),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Payload => 0,
            Self::HeaderInfo => 1,
            Self::SectionEnd => 2,
            Self::Metadata => 3,
        }
    }
}

/// 0x20-byte big-endian USM packet header.
///
/// `chunk_size` and `data_offset` both count from byte 8 of the packet,
/// so the payload spans `chunk_size - data_offset` bytes of which the
/// trailing `padding_size` are filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsmPacketHeader {
    pub magic: [u8; 4],
    pub chunk_size: u32,
    pub data_offset: u8,
    pub padding_size: u16,
    pub channel_number: u8,
    pub kind: PacketKind,
    pub frame_time: u32,
    pub frame_rate: u32,
}

impl UsmPacketHeader {
    pub const SIZE: usize = 0x20;
    /// Header bytes counted inside `chunk_size` (everything after byte 8).
    pub const INNER: u32 = 0x18;

    pub fn read(r: &mut ByteReader) -> Result<Self> {
        let start = r.pos();
        let mut magic = [0u8; 4];
        magic.copy_from_slice(r.take(4)?);
        let chunk_size = r.u32_be()?;
        r.skip(1)?;
        let data_offset = r.u8()?;
        let padding_size = r.u16_be()?;
        let channel_number = r.u8()?;
        r.skip(2)?;
        let kind = PacketKind::from_u8(r.u8()?, start + 0x0F)?;
        let frame_time = r.u32_be()?;
        let frame_rate = r.u32_be()?;
        r.skip(8)?;
        if u32::from(data_offset) < Self::INNER
            || chunk_size < u32::from(data_offset) + u32::from(padding_size)
        {
            return Err(CriError::invalid("USM packet framing underflow", start));
        }
        Ok(Self {
            magic,
            chunk_size,
            data_offset,
            padding_size,
            channel_number,
            kind,
            frame_time,
            frame_rate,
        })
    }

    pub fn emit(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.magic);
        self.chunk_size.write_be(dst);
        0u8.write_be(dst);
        self.data_offset.write_be(dst);
        self.padding_size.write_be(dst);
        self.channel_number.write_be(dst);
        0u8.write_be(dst);
        0u8.write_be(dst);
        self.kind.as_u8().write_be(dst);
        self.frame_time.write_be(dst);
        self.frame_rate.write_be(dst);
        0u32.write_be(dst);
        0u32.write_be(dst);
    }

    /// Payload length excluding trailing padding.
    pub fn payload_len(&self) -> usize {
        self.chunk_size as usize - self.data_offset as usize - self.padding_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usm_packet_header_roundtrip() {
        let header = UsmPacketHeader {
            magic: *SFV_MAGIC,
            chunk_size: 0x118,
            data_offset: 0x18,
            padding_size: 0x10,
            channel_number: 1,
            kind: PacketKind::Payload,
            frame_time: 299,
            frame_rate: 2997,
        };
        let mut raw = Vec::new();
        header.emit(&mut raw);
        assert_eq!(raw.len(), UsmPacketHeader::SIZE);

        let parsed = UsmPacketHeader::read(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_len(), 0x118 - 0x18 - 0x10);
    }

    #[test]
    fn cpk_chunk_header_is_little_endian() {
        let header = CpkChunkHeader {
            magic: *TOC_MAGIC,
            flag: 0xFF,
            packet_size: 0x1234,
        };
        let mut raw = Vec::new();
        header.emit(&mut raw);
        assert_eq!(&raw[..4], b"TOC ");
        assert_eq!(raw[4], 0xFF);
        assert_eq!(&raw[8..12], &[0x34, 0x12, 0, 0]);
    }

    #[test]
    fn packet_kind_rejects_unknown() {
        assert!(PacketKind::from_u8(7, 0).is_err());
    }
}
