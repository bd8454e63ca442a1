//! AFS2 (AWB) audio bank codec.
//!
//! An AWB is an offset-indexed bag of files: a little-endian header, a
//! run of entry IDs, then `count + 1` offsets whose gaps delimit the
//! payloads. Stored offsets are raw end positions; each is aligned up to
//! the bank's alignment before use as a start, so entry `i` occupies
//! `[align_up(offset[i]), offset[i+1])` and the padding between entries
//! belongs to neither.

use crate::structs::chunk::AFS2_MAGIC;
use crate::utils::bytes::{ByteReader, WriteBytesLe, align_up, pad_to};
use crate::utils::errors::{CriError, Result};

#[derive(Debug, Clone)]
pub struct Awb {
    pub version: u8,
    pub align: u16,
    pub subkey: u16,
    pub ids: Vec<u64>,
    /// Raw stored offsets, `count + 1` of them; the last is the total
    /// stored size.
    pub offsets: Vec<u64>,
    data: Vec<u8>,
}

impl Awb {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        r.expect_magic(AFS2_MAGIC)?;
        let version = r.u8()?;
        let offset_width = r.u8()?;
        let id_width = r.u16_le()?;
        let count = r.u32_le()? as usize;
        let align = r.u16_le()?;
        let subkey = r.u16_le()?;
        if align == 0 {
            return Err(CriError::invalid("AFS2 alignment of zero", 0x0C));
        }

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(read_uint(&mut r, id_width as u8)?);
        }

        let mut offsets = Vec::with_capacity(count + 1);
        for i in 0..=count {
            let pos = r.pos();
            let offset = read_uint(&mut r, offset_width)?;
            if let Some(prev) = offsets.last()
                && offset < *prev
            {
                return Err(CriError::invalid(
                    format!("AFS2 offsets not monotone at entry {i}"),
                    pos,
                ));
            }
            offsets.push(offset);
        }
        if offsets.last().copied().unwrap_or(0) as usize > data.len() {
            return Err(CriError::invalid("AFS2 end offset past input", 0x10));
        }

        Ok(Self {
            version,
            align,
            subkey,
            ids,
            offsets,
            data: data.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Stored offsets with the alignment rule applied.
    pub fn aligned_offsets(&self) -> Vec<u64> {
        self.offsets
            .iter()
            .map(|&o| align_up(o, u64::from(self.align)))
            .collect()
    }

    /// Payload of entry `index`: `[align_up(offset[i]), offset[i+1])`.
    pub fn entry(&self, index: usize) -> Result<&[u8]> {
        if index >= self.len() {
            return Err(CriError::invalid(
                format!("AFS2 entry {index} out of range"),
                0,
            ));
        }
        let start = align_up(self.offsets[index], u64::from(self.align)) as usize;
        let end = self.offsets[index + 1] as usize;
        if start > end {
            return Err(CriError::invalid(
                format!("AFS2 entry {index} start past its end"),
                start,
            ));
        }
        Ok(&self.data[start..end])
    }

    /// Restartable cursor over `(id, payload)` pairs in stored order.
    pub fn entries(&self) -> AwbEntries<'_> {
        AwbEntries {
            bank: self,
            index: 0,
        }
    }
}

pub struct AwbEntries<'a> {
    bank: &'a Awb,
    index: usize,
}

impl<'a> Iterator for AwbEntries<'a> {
    type Item = (u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.bank.len() {
            return None;
        }
        let id = self.bank.ids[self.index];
        let data = self.bank.entry(self.index).ok()?;
        self.index += 1;
        Some((id, data))
    }
}

fn read_uint(r: &mut ByteReader, width: u8) -> Result<u64> {
    match width {
        2 => Ok(u64::from(r.u16_le()?)),
        4 => Ok(u64::from(r.u32_le()?)),
        8 => r.u64_le(),
        other => Err(CriError::invalid(
            format!("AFS2 integer width {other} not in {{2,4,8}}"),
            r.pos(),
        )),
    }
}

/// Builds an AFS2 bank from in-order entries.
///
/// Stored offsets are raw end positions (the first is the raw header
/// size, the sentinel the total stored size); padding to the alignment is
/// written before every entry, none after the last. The offset width
/// widens to 8 only when the total breaks the 32-bit range.
#[derive(Debug, Clone)]
pub struct AwbBuilder {
    version: u8,
    align: u16,
    subkey: u16,
    entries: Vec<(u64, Vec<u8>)>,
}

impl Default for AwbBuilder {
    fn default() -> Self {
        Self {
            version: 2,
            align: 0x20,
            subkey: 0,
            entries: Vec::new(),
        }
    }
}

impl AwbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn align(mut self, align: u16) -> Self {
        self.align = align;
        self
    }

    pub fn subkey(mut self, subkey: u16) -> Self {
        self.subkey = subkey;
        self
    }

    /// Appends an entry with the next sequential ID.
    pub fn push(&mut self, data: Vec<u8>) -> &mut Self {
        let id = self.entries.len() as u64;
        self.push_with_id(id, data)
    }

    pub fn push_with_id(&mut self, id: u64, data: Vec<u8>) -> &mut Self {
        self.entries.push((id, data));
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if self.version == 1 && self.subkey != 0 {
            return Err(CriError::invalid("AFS2 version 1 cannot carry a subkey", 0));
        }
        if self.align == 0 {
            return Err(CriError::invalid("AFS2 alignment must be non-zero", 0));
        }

        let id_width: u16 = 2;
        let mut offset_width = 4u8;
        let (mut ends, mut total) = self.layout(id_width, offset_width);
        if total > u64::from(u32::MAX) {
            offset_width = 8;
            (ends, total) = self.layout(id_width, offset_width);
        }

        let count = self.entries.len();
        let header_size =
            16 + usize::from(id_width) * count + usize::from(offset_width) * (count + 1);

        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(AFS2_MAGIC);
        self.version.write_le(&mut out);
        offset_width.write_le(&mut out);
        id_width.write_le(&mut out);
        (count as u32).write_le(&mut out);
        self.align.write_le(&mut out);
        self.subkey.write_le(&mut out);
        for (id, _) in &self.entries {
            (*id as u16).write_le(&mut out);
        }
        for &end in &ends {
            match offset_width {
                4 => (end as u32).write_le(&mut out),
                _ => end.write_le(&mut out),
            }
        }
        debug_assert_eq!(out.len(), header_size);

        for (_, data) in &self.entries {
            let target = align_up(out.len() as u64, u64::from(self.align)) as usize;
            pad_to(&mut out, target);
            out.extend_from_slice(data);
        }
        debug_assert_eq!(out.len() as u64, total);
        Ok(out)
    }

    /// Raw end offsets (header size, then each entry's unpadded end; the
    /// final element is the sentinel) plus the total size.
    fn layout(&self, id_width: u16, offset_width: u8) -> (Vec<u64>, u64) {
        let count = self.entries.len();
        let header_size =
            16 + usize::from(id_width) * count + usize::from(offset_width) * (count + 1);
        let align = u64::from(self.align);

        let mut ends = Vec::with_capacity(count + 1);
        let mut cursor = header_size as u64;
        ends.push(cursor);
        for (_, data) in &self.entries {
            cursor = align_up(cursor, align) + data.len() as u64;
            ends.push(cursor);
        }
        (ends, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_file_bank_offsets() {
        let mut builder = AwbBuilder::new().align(0x20);
        builder.push(b"AA".to_vec());
        builder.push(b"BBBB".to_vec());
        let raw = builder.build().unwrap();

        let bank = Awb::parse(&raw).unwrap();
        // Header is 16 + 2*2 + 4*3 = 0x20; already aligned.
        let h = 0x20u64;
        assert_eq!(bank.aligned_offsets(), vec![h, h + 0x20, h + 0x40]);
        // Raw offsets are exact payload boundaries.
        assert_eq!(bank.offsets, vec![0x20, 0x22, 0x44]);
        // Sentinel equals the total stored size.
        assert_eq!(*bank.offsets.last().unwrap() as usize, raw.len());
    }

    #[test]
    fn entries_roundtrip() {
        let payloads: Vec<Vec<u8>> = vec![vec![1; 5], vec![2; 0x21], vec![3; 1]];
        let mut builder = AwbBuilder::new();
        for p in &payloads {
            builder.push(p.clone());
        }
        let bank = Awb::parse(&builder.build().unwrap()).unwrap();
        assert_eq!(bank.len(), 3);
        for (i, (id, data)) in bank.entries().enumerate() {
            assert_eq!(id, i as u64);
            assert_eq!(data, payloads[i].as_slice());
        }
        // Restartable: a second cursor sees the same entries.
        assert_eq!(bank.entries().count(), 3);
    }

    #[test]
    fn offsets_monotone_checked() {
        let mut builder = AwbBuilder::new();
        builder.push(vec![0; 8]);
        let mut raw = builder.build().unwrap();
        // Corrupt the sentinel to sit below the first offset.
        let ofs_pos = 16 + 2;
        raw[ofs_pos + 4..ofs_pos + 8].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            Awb::parse(&raw),
            Err(CriError::InvalidData { .. })
        ));
    }

    #[test]
    fn version1_subkey_rejected() {
        let mut builder = AwbBuilder::new().version(1).subkey(5);
        builder.push(vec![0; 4]);
        assert!(builder.build().is_err());
    }

    #[test]
    fn subkey_surfaced() {
        let mut builder = AwbBuilder::new().subkey(0x1234);
        builder.push(vec![9; 4]);
        let bank = Awb::parse(&builder.build().unwrap()).unwrap();
        assert_eq!(bank.subkey, 0x1234);
    }
}
