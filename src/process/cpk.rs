//! CPK archive reader and builder.
//!
//! A CPK is a 16-byte chunk header plus an @UTF table named `CpkHeader`
//! in the first 0x800-aligned region, ending in the `(c)CRI` signature.
//! The header table points at sibling chunk-wrapped tables (`TOC `,
//! `ITOC`, `ETOC`, `GTOC`, `HTOC`, `HGTOC`) and at the content region.
//! Stored files whose `ExtractSize` exceeds `FileSize` are
//! CRILAYLA-compressed.

use std::path::Path;

use anyhow::Context;
use log::warn;

use crate::process::crilayla;
use crate::structs::chunk::{
    CPK_MAGIC, CRI_SIGNATURE, CpkChunkHeader, ETOC_MAGIC, GTOC_MAGIC, ITOC_MAGIC, TOC_MAGIC,
};
use crate::structs::utf::{CellValue, UtfBuilder, UtfTable};
use crate::utils::bytes::{ByteReader, align_up, pad_to};
use crate::utils::errors::{CriError, Result};

const REGION: u64 = 0x800;

/// One stored file, resolved to absolute coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpkEntry {
    pub dir: String,
    pub name: String,
    pub id: u64,
    pub offset: u64,
    pub file_size: u64,
    pub extract_size: u64,
}

impl CpkEntry {
    pub fn is_compressed(&self) -> bool {
        self.extract_size > self.file_size
    }

    /// `dir/name` with forward slashes.
    pub fn path(&self) -> String {
        if self.dir.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.dir, self.name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cpk {
    pub header: UtfTable,
    pub toc: Option<UtfTable>,
    pub itoc: Option<UtfTable>,
    pub etoc: Option<UtfTable>,
    pub gtoc: Option<UtfTable>,
    pub htoc: Option<UtfTable>,
    pub hgtoc: Option<UtfTable>,
    data: Vec<u8>,
}

impl Cpk {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let chunk = CpkChunkHeader::read(&mut r)?;
        if chunk.magic != *CPK_MAGIC {
            return Err(CriError::InvalidMagic {
                expected: CPK_MAGIC,
                actual: chunk.magic.to_vec(),
            });
        }
        let header = UtfTable::parse(&data[CpkChunkHeader::SIZE..])?;

        let mut cpk = Self {
            header,
            toc: None,
            itoc: None,
            etoc: None,
            gtoc: None,
            htoc: None,
            hgtoc: None,
            data: data.to_vec(),
        };
        cpk.toc = cpk.sibling_table(data, "TocOffset", "TocSize", TOC_MAGIC)?;
        cpk.itoc = cpk.sibling_table(data, "ItocOffset", "ItocSize", ITOC_MAGIC)?;
        cpk.etoc = cpk.sibling_table(data, "EtocOffset", "EtocSize", ETOC_MAGIC)?;
        cpk.gtoc = cpk.sibling_table(data, "GtocOffset", "GtocSize", GTOC_MAGIC)?;
        cpk.htoc = cpk.sibling_table(data, "HtocOffset", "HtocSize", b"HTOC")?;
        cpk.hgtoc = cpk.sibling_table(data, "HgtocOffset", "HgtocSize", b"HGTO")?;
        Ok(cpk)
    }

    fn sibling_table(
        &self,
        data: &[u8],
        offset_column: &str,
        size_column: &str,
        magic: &'static [u8; 4],
    ) -> Result<Option<UtfTable>> {
        if !self.header.has_column(offset_column) {
            return Ok(None);
        }
        let offset = self.header.number(0, offset_column).unwrap_or(0) as usize;
        if offset == 0 {
            return Ok(None);
        }
        let size = self.header.number(0, size_column).unwrap_or(0) as usize;
        if offset + size > data.len() {
            return Err(CriError::invalid(
                format!("{offset_column} table past end of archive"),
                offset,
            ));
        }
        let mut r = ByteReader::at(data, offset);
        let chunk = CpkChunkHeader::read(&mut r)?;
        if chunk.magic != *magic {
            return Err(CriError::InvalidMagic {
                expected: magic,
                actual: chunk.magic.to_vec(),
            });
        }
        Ok(Some(UtfTable::parse(&data[offset + CpkChunkHeader::SIZE..])?))
    }

    pub fn mode(&self) -> u64 {
        self.header.number(0, "CpkMode").unwrap_or(0)
    }

    pub fn align(&self) -> u64 {
        self.header.number(0, "Align").unwrap_or(REGION)
    }

    /// All stored files in TOC order, or in ID order when the archive
    /// only carries an ITOC.
    pub fn entries(&self) -> Result<Vec<CpkEntry>> {
        if let Some(toc) = &self.toc {
            let toc_offset = self.header.number(0, "TocOffset")?;
            let mut entries = Vec::with_capacity(toc.row_count());
            for row in 0..toc.row_count() {
                entries.push(CpkEntry {
                    dir: toc.string(row, "DirName").unwrap_or_default().to_owned(),
                    name: toc.string(row, "FileName")?.to_owned(),
                    id: toc.number(row, "ID").unwrap_or(row as u64),
                    offset: toc_offset + toc.number(row, "FileOffset")?,
                    file_size: toc.number(row, "FileSize")?,
                    extract_size: toc.number(row, "ExtractSize")?,
                });
            }
            return Ok(entries);
        }
        if self.itoc.is_some() {
            return self.itoc_entries();
        }
        Err(CriError::invalid("CPK carries neither TOC nor ITOC", 0x10))
    }

    /// ITOC-only (mode 0) layout: files sit at `ContentOffset` in ID
    /// order, sizes chosen from DataH when present there, else DataL.
    fn itoc_entries(&self) -> Result<Vec<CpkEntry>> {
        let itoc = self.itoc.as_ref().expect("checked by caller");
        let data_l = UtfTable::parse(itoc.bytes(0, "DataL")?)?;
        let data_h = UtfTable::parse(itoc.bytes(0, "DataH")?)?;
        // An empty side still serializes with one placeholder row; the
        // stored counts decide which sides are live.
        let live_l = itoc.number(0, "FilesL").unwrap_or(data_l.row_count() as u64) as usize;
        let live_h = itoc.number(0, "FilesH").unwrap_or(data_h.row_count() as u64) as usize;
        let files = self.header.number(0, "Files")?;
        let align = self.align();
        let mut offset = self.header.number(0, "ContentOffset")?;

        let find = |table: &UtfTable, live: usize, id: u64| -> Option<(u64, u64)> {
            (0..table.row_count().min(live))
                .find(|&row| table.number(row, "ID").ok() == Some(id))
                .map(|row| {
                    (
                        table.number(row, "FileSize").unwrap_or(0),
                        table.number(row, "ExtractSize").unwrap_or(0),
                    )
                })
        };

        let mut entries = Vec::with_capacity(files as usize);
        for id in 0..files {
            let Some((file_size, extract_size)) = find(&data_h, live_h, id)
                .or_else(|| find(&data_l, live_l, id))
            else {
                return Err(CriError::invalid(format!("ITOC is missing ID {id}"), 0x10));
            };
            entries.push(CpkEntry {
                dir: String::new(),
                name: id.to_string(),
                id,
                offset,
                file_size,
                extract_size,
            });
            offset += align_up(file_size, align);
        }
        Ok(entries)
    }

    /// Copies an entry out of the archive, decompressing when stored
    /// compressed.
    pub fn read_entry(&self, entry: &CpkEntry) -> Result<Vec<u8>> {
        let start = entry.offset as usize;
        let end = start + entry.file_size as usize;
        if end > self.data.len() {
            return Err(CriError::invalid(
                format!("file {} past end of archive", entry.path()),
                start,
            ));
        }
        let stored = &self.data[start..end];
        if entry.is_compressed() {
            let out = crilayla::decompress(stored)?;
            if out.len() as u64 != entry.extract_size {
                warn!(
                    "{}: extract size {} but decompressed {}",
                    entry.path(),
                    entry.extract_size,
                    out.len()
                );
            }
            Ok(out)
        } else {
            Ok(stored.to_vec())
        }
    }

    pub fn read_by_name(&self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .entries()?
            .into_iter()
            .find(|e| e.name == name || e.path() == name)
            .ok_or_else(|| CriError::invalid(format!("no file {name} in archive"), 0))?;
        self.read_entry(&entry)
    }

    /// Writes every entry under `dir`, preserving stored paths.
    pub fn extract_to_dir(&self, dir: &Path) -> anyhow::Result<()> {
        for entry in self.entries()? {
            let out = dir.join(entry.dir.as_str()).join(entry.name.as_str());
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let data = self.read_entry(&entry)?;
            std::fs::write(&out, data).with_context(|| format!("writing {}", out.display()))?;
        }
        Ok(())
    }
}

/// Sort key for the archive walk: case-insensitive, `_` after letters.
fn walk_key(name: &str) -> Vec<u8> {
    name.bytes()
        .map(|b| match b {
            b'_' => b'z' + 1,
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

#[derive(Debug, Clone)]
struct InputFile {
    dir: String,
    name: String,
    data: Vec<u8>,
}

/// Builds CPK archives in modes 0 through 3.
///
/// Mode 0 is ITOC-only (numeric filenames, no compression); mode 1 is
/// the general TOC layout; mode 2 adds a `CpkExtendId` ITOC and an ETOC;
/// mode 3 replaces the ITOC with a fixed GTOC group table.
#[derive(Debug, Clone)]
pub struct CpkBuilder {
    mode: u16,
    tver: Option<String>,
    compress: bool,
    encrypt_tables: bool,
    local_dir: String,
    files: Vec<InputFile>,
}

impl CpkBuilder {
    pub fn new(mode: u16) -> Self {
        Self {
            mode,
            tver: None,
            compress: false,
            encrypt_tables: false,
            local_dir: String::new(),
            files: Vec::new(),
        }
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn encrypted(mut self, encrypt: bool) -> Self {
        self.encrypt_tables = encrypt;
        self
    }

    pub fn tver(mut self, tver: impl Into<String>) -> Self {
        self.tver = Some(tver.into());
        self
    }

    /// Label stored in the ETOC `LocalDir` cell (modes 2 and 3).
    pub fn local_dir(mut self, dir: impl Into<String>) -> Self {
        self.local_dir = dir.into();
        self
    }

    pub fn add(&mut self, dir: impl Into<String>, name: impl Into<String>, data: Vec<u8>) -> &mut Self {
        self.files.push(InputFile {
            dir: dir.into(),
            name: name.into(),
            data,
        });
        self
    }

    /// Walks `root` in the archive order (case-insensitive lexicographic,
    /// `_` sorted after letters; files of a directory before its
    /// subdirectories) and adds every file.
    pub fn add_dir(&mut self, root: &Path) -> anyhow::Result<&mut Self> {
        self.walk(root, String::new())?;
        Ok(self)
    }

    fn walk(&mut self, dir: &Path, rel: String) -> anyhow::Result<()> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for entry in
            std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() {
                dirs.push(name);
            } else {
                files.push(name);
            }
        }
        files.sort_by_key(|n| walk_key(n));
        dirs.sort_by_key(|n| walk_key(n));

        for name in files {
            let data = std::fs::read(dir.join(&name))
                .with_context(|| format!("reading {}", dir.join(&name).display()))?;
            self.add(rel.clone(), name, data);
        }
        for name in dirs {
            let child = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            self.walk(&dir.join(&name), child)?;
        }
        Ok(())
    }

    fn default_tver(&self) -> &'static str {
        match self.mode {
            0 => "CPKMC2.18.04, DLL2.78.04",
            1 => "CPKMC2.45.00, DLL3.15.00",
            2 => "CPKMC2.49.32, DLL3.24.00",
            _ => "CPKFBSTD1.49.35, DLL3.24.00",
        }
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        match self.mode {
            0 => self.build_mode0(),
            1 | 2 | 3 => self.build_toc_modes(),
            other => Err(CriError::unsupported(format!("CpkMode {other}"))),
        }
    }

    /// Stored blob and extract size for one input file.
    fn stored_blob(&self, data: &[u8]) -> Result<(Vec<u8>, u64)> {
        if self.compress && data.len() >= 0x100 {
            let packed = crilayla::compress(data)?;
            if packed.len() < data.len() {
                return Ok((packed, data.len() as u64));
            }
        }
        Ok((data.to_vec(), data.len() as u64))
    }

    fn build_toc_modes(&self) -> Result<Vec<u8>> {
        let mut files = self.files.clone();
        files.sort_by(|a, b| {
            (walk_key(&a.dir), walk_key(&a.name)).cmp(&(walk_key(&b.dir), walk_key(&b.name)))
        });

        let mut stored = Vec::with_capacity(files.len());
        for file in &files {
            if file.data.len() as u64 > u64::from(u32::MAX) {
                return Err(CriError::invalid(
                    format!("{} exceeds the 4 GiB single-file limit", file.name),
                    0,
                ));
            }
            stored.push(self.stored_blob(&file.data)?);
        }

        let enabled_packed: u64 = stored.iter().map(|(blob, _)| blob.len() as u64).sum();
        let enabled_data: u64 = stored.iter().map(|(_, extract)| extract).sum();
        let content_size: u64 = stored
            .iter()
            .map(|(blob, _)| align_up(blob.len() as u64, REGION))
            .sum();

        // Secondary table between the TOC and the content region.
        let itoc = (self.mode == 2).then(|| self.build_extend_itoc(files.len()));
        let gtoc = (self.mode == 3).then(|| self.build_gtoc()).transpose()?;
        let itoc = itoc.transpose()?;
        let second_len = [&itoc, &gtoc]
            .into_iter()
            .flatten()
            .map(|t| align_up((CpkChunkHeader::SIZE + t.len()) as u64, REGION))
            .sum::<u64>();

        // The serialized TOC length cannot depend on the offset values
        // (fixed-width cells), but the storage election can; iterate to a
        // fixed point and fail loudly if the sizes never agree.
        let mut toc_len = 0u64;
        let mut toc = Vec::new();
        let mut converged = false;
        let mut offsets: Vec<u64> = (1..=files.len() as u64).collect();
        for _ in 0..4 {
            toc = self.build_toc(&files, &stored, &offsets)?;
            let new_len = toc.len() as u64;
            let content_rel = align_up(CpkChunkHeader::SIZE as u64 + new_len, REGION) + second_len;
            let mut cursor = content_rel;
            offsets = stored
                .iter()
                .map(|(blob, _)| {
                    let here = cursor;
                    cursor += align_up(blob.len() as u64, REGION);
                    here
                })
                .collect();
            if new_len == toc_len {
                converged = true;
                break;
            }
            toc_len = new_len;
        }
        if !converged {
            return Err(CriError::invalid("TOC size estimate did not converge", 0));
        }

        let toc_region = align_up((CpkChunkHeader::SIZE + toc.len()) as u64, REGION);
        let content_offset = REGION + toc_region + second_len;
        let etoc = (self.mode >= 2).then(|| self.build_etoc()).transpose()?;

        let cpk_table = self.build_cpk_header(
            files.len() as u32,
            content_offset,
            content_size,
            enabled_packed,
            enabled_data,
            toc.len() as u64,
            toc_region,
            itoc.as_ref().map(|t| t.len() as u64),
            gtoc.as_ref().map(|t| t.len() as u64),
            etoc.as_ref().map(|t| t.len() as u64),
        )?;
        if align_up((CpkChunkHeader::SIZE + cpk_table.len()) as u64, REGION) != REGION {
            return Err(CriError::invalid("CpkHeader overflows its region", 0));
        }

        let flag = 0xFF;
        let mut out = Vec::new();
        emit_region(&mut out, *CPK_MAGIC, flag, &cpk_table, true);
        emit_region(&mut out, *TOC_MAGIC, flag, &toc, false);
        if let Some(t) = &itoc {
            emit_region(&mut out, *ITOC_MAGIC, flag, t, false);
        }
        if let Some(t) = &gtoc {
            emit_region(&mut out, *GTOC_MAGIC, flag, t, false);
        }
        debug_assert_eq!(out.len() as u64, content_offset);
        for (blob, _) in &stored {
            out.extend_from_slice(blob);
            let target = align_up(out.len() as u64, REGION) as usize;
            pad_to(&mut out, target);
        }
        if let Some(t) = &etoc {
            let header = CpkChunkHeader {
                magic: *ETOC_MAGIC,
                flag,
                packet_size: t.len() as u32,
            };
            header.emit(&mut out);
            out.extend_from_slice(t);
        }
        Ok(out)
    }

    fn build_toc(
        &self,
        files: &[InputFile],
        stored: &[(Vec<u8>, u64)],
        offsets: &[u64],
    ) -> Result<Vec<u8>> {
        let mut builder = UtfBuilder::new("CpkTocInfo").encrypted(self.encrypt_tables);
        for (i, file) in files.iter().enumerate() {
            builder.push_row(vec![
                ("DirName".into(), CellValue::Str(file.dir.clone())),
                ("FileName".into(), CellValue::Str(file.name.clone())),
                ("FileSize".into(), CellValue::U32(stored[i].0.len() as u32)),
                ("ExtractSize".into(), CellValue::U32(stored[i].1 as u32)),
                ("FileOffset".into(), CellValue::U64(offsets[i])),
                ("ID".into(), CellValue::U32(i as u32)),
                ("UserString".into(), CellValue::Str(String::new())),
            ]);
        }
        builder.build()
    }

    fn build_extend_itoc(&self, count: usize) -> Result<Vec<u8>> {
        let mut builder = UtfBuilder::new("CpkExtendId").encrypted(self.encrypt_tables);
        for i in 0..count {
            builder.push_row(vec![
                ("ID".into(), CellValue::I32(i as i32)),
                ("TocIndex".into(), CellValue::I32(i as i32)),
            ]);
        }
        builder.build()
    }

    fn build_etoc(&self) -> Result<Vec<u8>> {
        let mut builder = UtfBuilder::new("CpkEtocInfo").encrypted(self.encrypt_tables);
        builder.push_row(vec![
            ("UpdateDateTime".into(), CellValue::U64(0)),
            ("LocalDir".into(), CellValue::Str(self.local_dir.clone())),
        ]);
        builder.build()
    }

    /// The fixed Glink/Flink/Attr group tables mode 3 ships.
    fn build_gtoc(&self) -> Result<Vec<u8>> {
        let mut gdata = UtfBuilder::new("CpkGtocGlink").encrypted(self.encrypt_tables);
        gdata.push_row(vec![
            ("Gname".into(), CellValue::Str(String::new())),
            ("Child".into(), CellValue::I32(-1)),
            ("Next".into(), CellValue::I32(0)),
        ]);
        gdata.push_row(vec![
            ("Gname".into(), CellValue::Str("(none)".into())),
            ("Child".into(), CellValue::I32(0)),
            ("Next".into(), CellValue::I32(0)),
        ]);

        let mut fdata = UtfBuilder::new("CpkGtocFlink").encrypted(self.encrypt_tables);
        for (next, child, sort_flink) in [(-1, -1, 2), (2, 0, 1), (0, 1, 2)] {
            fdata.push_row(vec![
                ("Next".into(), CellValue::I32(next)),
                ("Child".into(), CellValue::I32(child)),
                ("SortFlink".into(), CellValue::I32(sort_flink)),
                ("Aindex".into(), CellValue::U16(0)),
            ]);
        }

        let mut attr = UtfBuilder::new("CpkGtocAttr").encrypted(self.encrypt_tables);
        attr.push_row(vec![
            ("Aname".into(), CellValue::Str(String::new())),
            ("Align".into(), CellValue::U16(REGION as u16)),
            ("Files".into(), CellValue::U32(0)),
            ("FileSize".into(), CellValue::U32(0)),
        ]);

        let mut builder = UtfBuilder::new("CpkGtocInfo").encrypted(self.encrypt_tables);
        builder.push_row(vec![
            ("Glink".into(), CellValue::U32(2)),
            ("Flink".into(), CellValue::U32(3)),
            ("Attr".into(), CellValue::U32(1)),
            ("Gdata".into(), CellValue::Bytes(gdata.build()?)),
            ("Fdata".into(), CellValue::Bytes(fdata.build()?)),
            ("Attrdata".into(), CellValue::Bytes(attr.build()?)),
        ]);
        builder.build()
    }

    #[allow(clippy::too_many_arguments)]
    fn build_cpk_header(
        &self,
        files: u32,
        content_offset: u64,
        content_size: u64,
        enabled_packed: u64,
        enabled_data: u64,
        toc_size: u64,
        toc_region: u64,
        itoc_size: Option<u64>,
        gtoc_size: Option<u64>,
        etoc_size: Option<u64>,
    ) -> Result<Vec<u8>> {
        let tver = self
            .tver
            .clone()
            .unwrap_or_else(|| self.default_tver().to_owned());
        let revision: u16 = match self.mode {
            1 => 11,
            2 | 3 => 14,
            _ => 0,
        };

        let mut row: Vec<(String, CellValue)> = vec![
            (
                "UpdateDateTime".into(),
                CellValue::U64(u64::from(self.mode == 3)),
            ),
            ("ContentOffset".into(), CellValue::U64(content_offset)),
            ("ContentSize".into(), CellValue::U64(content_size)),
            ("TocOffset".into(), CellValue::U64(REGION)),
            ("TocSize".into(), CellValue::U64(toc_size)),
        ];
        if let Some(etoc) = etoc_size {
            row.push((
                "EtocOffset".into(),
                CellValue::U64(content_offset + content_size),
            ));
            row.push(("EtocSize".into(), CellValue::U64(etoc)));
        } else {
            row.push(("EtocOffset".into(), CellValue::U64(0)));
            row.push(("EtocSize".into(), CellValue::U64(0)));
        }
        if let Some(itoc) = itoc_size {
            row.push(("ItocOffset".into(), CellValue::U64(REGION + toc_region)));
            row.push(("ItocSize".into(), CellValue::U64(itoc)));
        } else {
            row.push(("ItocOffset".into(), CellValue::U64(0)));
            row.push(("ItocSize".into(), CellValue::U64(0)));
        }
        if let Some(gtoc) = gtoc_size {
            row.push(("GtocOffset".into(), CellValue::U64(REGION + toc_region)));
            row.push(("GtocSize".into(), CellValue::U64(gtoc)));
        } else {
            row.push(("GtocOffset".into(), CellValue::U64(0)));
            row.push(("GtocSize".into(), CellValue::U64(0)));
        }
        row.extend([
            (
                "EnabledPackedSize".into(),
                CellValue::U64(enabled_packed),
            ),
            ("EnabledDataSize".into(), CellValue::U64(enabled_data)),
            ("Files".into(), CellValue::U32(files)),
            ("Groups".into(), CellValue::U32(0)),
            ("Attrs".into(), CellValue::U32(0)),
            ("Version".into(), CellValue::U16(7)),
            ("Revision".into(), CellValue::U16(revision)),
            ("Align".into(), CellValue::U16(REGION as u16)),
            ("Sorted".into(), CellValue::U16(1)),
            ("EnableFileName".into(), CellValue::U16(1)),
            ("EID".into(), CellValue::U16(0)),
            ("CpkMode".into(), CellValue::U16(self.mode)),
            ("Tvers".into(), CellValue::Str(tver)),
            ("Codec".into(), CellValue::U32(0)),
            ("DpkItoc".into(), CellValue::U32(0)),
            ("EnableTocCrc".into(), CellValue::U16(0)),
            ("EnableFileCrc".into(), CellValue::U16(0)),
            ("CrcMode".into(), CellValue::U32(0)),
            ("CrcTable".into(), CellValue::Bytes(Vec::new())),
            ("FileSize".into(), CellValue::U64(0)),
            ("TocCrc".into(), CellValue::U32(0)),
            ("HtocOffset".into(), CellValue::U64(0)),
            ("HtocSize".into(), CellValue::U64(0)),
            ("ItocCrc".into(), CellValue::U32(0)),
            ("GtocCrc".into(), CellValue::U32(0)),
            ("HgtocOffset".into(), CellValue::U64(0)),
            ("HgtocSize".into(), CellValue::U64(0)),
            ("TotalDataSize".into(), CellValue::U64(0)),
            ("Tocs".into(), CellValue::U32(0)),
            ("TotalFiles".into(), CellValue::U32(0)),
            ("Directories".into(), CellValue::U32(0)),
            ("Updates".into(), CellValue::U32(0)),
            ("Comment".into(), CellValue::Str(String::new())),
        ]);

        let mut builder = UtfBuilder::new("CpkHeader").encrypted(self.encrypt_tables);
        builder.push_row(row);
        builder.build()
    }

    fn build_mode0(&self) -> Result<Vec<u8>> {
        if self.compress {
            return Err(CriError::unsupported("CRILAYLA compression in CpkMode 0"));
        }
        if self.files.len() > 0xFFFF {
            return Err(CriError::invalid(
                "CpkMode 0 holds at most 65535 files",
                0,
            ));
        }
        let mut files = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let id: u64 = file.name.parse().map_err(|_| {
                CriError::invalid(format!("CpkMode 0 filename {} is not numeric", file.name), 0)
            })?;
            files.push((id, file));
        }
        files.sort_by_key(|(id, _)| *id);

        let mut data_l = UtfBuilder::new("CpkItocL").encrypted(self.encrypt_tables);
        let mut data_h = UtfBuilder::new("CpkItocH").encrypted(self.encrypt_tables);
        let mut count_l = 0u32;
        let mut count_h = 0u32;
        let mut content_size = 0u64;
        let enabled: u64 = files.iter().map(|(_, f)| f.data.len() as u64).sum();
        for (index, (_, file)) in files.iter().enumerate() {
            let size = file.data.len() as u64;
            content_size += align_up(size, REGION);
            if size > 0xFFFF {
                data_h.push_row(vec![
                    ("ID".into(), CellValue::U16(index as u16)),
                    ("FileSize".into(), CellValue::U32(size as u32)),
                    ("ExtractSize".into(), CellValue::U32(size as u32)),
                ]);
                count_h += 1;
            } else {
                data_l.push_row(vec![
                    ("ID".into(), CellValue::U16(index as u16)),
                    ("FileSize".into(), CellValue::U16(size as u16)),
                    ("ExtractSize".into(), CellValue::U16(size as u16)),
                ]);
                count_l += 1;
            }
        }
        // A side with no rows still serializes with one placeholder row.
        if count_l == 0 {
            data_l.push_row(vec![
                ("ID".into(), CellValue::U16(0)),
                ("FileSize".into(), CellValue::U16(0)),
                ("ExtractSize".into(), CellValue::U16(0)),
            ]);
        }
        if count_h == 0 {
            data_h.push_row(vec![
                ("ID".into(), CellValue::U32(0)),
                ("FileSize".into(), CellValue::U32(0)),
                ("ExtractSize".into(), CellValue::U32(0)),
            ]);
        }

        let mut itoc = UtfBuilder::new("CpkItocInfo").encrypted(self.encrypt_tables);
        itoc.push_row(vec![
            ("FilesL".into(), CellValue::U32(count_l)),
            ("FilesH".into(), CellValue::U32(count_h)),
            ("DataL".into(), CellValue::Bytes(data_l.build()?)),
            ("DataH".into(), CellValue::Bytes(data_h.build()?)),
        ]);
        let itoc = itoc.build()?;
        let itoc_region = align_up((CpkChunkHeader::SIZE + itoc.len()) as u64, REGION);
        let content_offset = REGION + itoc_region;

        let tver = self
            .tver
            .clone()
            .unwrap_or_else(|| self.default_tver().to_owned());
        let mut header = UtfBuilder::new("CpkHeader").encrypted(self.encrypt_tables);
        header.push_row(vec![
            ("UpdateDateTime".into(), CellValue::U64(0)),
            ("ContentOffset".into(), CellValue::U64(content_offset)),
            ("ContentSize".into(), CellValue::U64(content_size)),
            ("ItocOffset".into(), CellValue::U64(REGION)),
            ("ItocSize".into(), CellValue::U64(itoc.len() as u64)),
            ("EnabledPackedSize".into(), CellValue::U64(enabled)),
            ("EnabledDataSize".into(), CellValue::U64(enabled)),
            ("Files".into(), CellValue::U32(files.len() as u32)),
            ("Groups".into(), CellValue::U32(0)),
            ("Attrs".into(), CellValue::U32(0)),
            ("Version".into(), CellValue::U16(7)),
            ("Revision".into(), CellValue::U16(0)),
            ("Align".into(), CellValue::U16(REGION as u16)),
            ("Sorted".into(), CellValue::U16(0)),
            ("EID".into(), CellValue::U16(0)),
            ("CpkMode".into(), CellValue::U16(0)),
            ("Tvers".into(), CellValue::Str(tver)),
            ("Codec".into(), CellValue::U32(0)),
            ("DpkItoc".into(), CellValue::U32(0)),
            ("FileSize".into(), CellValue::U64(0)),
            ("TocOffset".into(), CellValue::U64(0)),
            ("TocSize".into(), CellValue::U64(0)),
            ("TocCrc".into(), CellValue::U32(0)),
            ("EtocOffset".into(), CellValue::U64(0)),
            ("EtocSize".into(), CellValue::U64(0)),
            ("ItocCrc".into(), CellValue::U32(0)),
            ("GtocOffset".into(), CellValue::U64(0)),
            ("GtocSize".into(), CellValue::U64(0)),
            ("GtocCrc".into(), CellValue::U32(0)),
            ("TotalDataSize".into(), CellValue::U64(0)),
            ("Tocs".into(), CellValue::U32(0)),
            ("TotalFiles".into(), CellValue::U32(0)),
            ("Directories".into(), CellValue::U32(0)),
            ("Updates".into(), CellValue::U32(0)),
            ("Comment".into(), CellValue::Str(String::new())),
        ]);
        let cpk_table = header.build()?;
        if align_up((CpkChunkHeader::SIZE + cpk_table.len()) as u64, REGION) != REGION {
            return Err(CriError::invalid("CpkHeader overflows its region", 0));
        }

        let mut out = Vec::new();
        emit_region(&mut out, *CPK_MAGIC, 0, &cpk_table, true);
        emit_region(&mut out, *ITOC_MAGIC, 0, &itoc, false);
        debug_assert_eq!(out.len() as u64, content_offset);
        for (_, file) in &files {
            out.extend_from_slice(&file.data);
            let target = align_up(out.len() as u64, REGION) as usize;
            pad_to(&mut out, target);
        }
        Ok(out)
    }
}

/// Emits a chunk header plus table, padded out to the 0x800 region
/// boundary; the CpkHeader region ends in `(c)CRI`.
fn emit_region(out: &mut Vec<u8>, magic: [u8; 4], flag: u32, table: &[u8], signature: bool) {
    let header = CpkChunkHeader {
        magic,
        flag,
        packet_size: table.len() as u32,
    };
    header.emit(out);
    out.extend_from_slice(table);
    let end = align_up(out.len() as u64, REGION) as usize;
    if signature {
        pad_to(out, end - CRI_SIGNATURE.len());
        out.extend_from_slice(CRI_SIGNATURE);
    } else {
        pad_to(out, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_files() -> Vec<(&'static str, &'static str, Vec<u8>)> {
        vec![
            ("", "readme.txt", b"hello cpk".to_vec()),
            ("sound", "bgm_01.adx", vec![0x80, 0x00, 0x12, 0x34]),
            ("sound", "Zelda.adx", vec![7; 0x900]),
            ("sound", "_sys.bin", vec![1, 2, 3]),
        ]
    }

    fn build_sample(mode: u16) -> Vec<u8> {
        let mut builder = CpkBuilder::new(mode);
        for (dir, name, data) in sample_files() {
            builder.add(dir, name, data);
        }
        builder.build().unwrap()
    }

    #[test]
    fn walk_order_puts_underscore_after_letters() {
        let mut names = vec!["_sys.bin", "Zelda.adx", "bgm_01.adx"];
        names.sort_by_key(|n| walk_key(n));
        assert_eq!(names, vec!["bgm_01.adx", "Zelda.adx", "_sys.bin"]);
    }

    #[test]
    fn mode1_roundtrip() {
        let raw = build_sample(1);
        assert_eq!(&raw[..4], b"CPK ");
        assert_eq!(&raw[0x800 - 6..0x800], b"(c)CRI");

        let cpk = Cpk::parse(&raw).unwrap();
        assert_eq!(cpk.mode(), 1);
        let entries = cpk.entries().unwrap();
        assert_eq!(entries.len(), 4);
        // Root files first, then the sorted sound/ directory.
        assert_eq!(entries[0].path(), "readme.txt");
        assert_eq!(entries[1].path(), "sound/bgm_01.adx");
        assert_eq!(entries[2].path(), "sound/Zelda.adx");
        assert_eq!(entries[3].path(), "sound/_sys.bin");

        for entry in &entries {
            let expected = sample_files()
                .into_iter()
                .find(|(_, name, _)| *name == entry.name)
                .unwrap()
                .2;
            assert_eq!(cpk.read_entry(entry).unwrap(), expected);
        }
    }

    #[test]
    fn build_is_deterministic() {
        assert_eq!(build_sample(1), build_sample(1));
        assert_eq!(build_sample(3), build_sample(3));
    }

    #[test]
    fn mode2_and_mode3_siblings() {
        let cpk = Cpk::parse(&build_sample(2)).unwrap();
        assert!(cpk.toc.is_some());
        assert!(cpk.itoc.is_some());
        assert!(cpk.etoc.is_some());
        assert_eq!(cpk.itoc.as_ref().unwrap().name, "CpkExtendId");
        assert_eq!(
            cpk.etoc.as_ref().unwrap().string(0, "LocalDir").unwrap(),
            ""
        );

        let cpk = Cpk::parse(&build_sample(3)).unwrap();
        assert!(cpk.gtoc.is_some());
        assert!(cpk.itoc.is_none());
        let gtoc = cpk.gtoc.as_ref().unwrap();
        assert_eq!(gtoc.number(0, "Flink").unwrap(), 3);
        let fdata = UtfTable::parse(gtoc.bytes(0, "Fdata").unwrap()).unwrap();
        assert_eq!(fdata.row_count(), 3);
    }

    #[test]
    fn compressed_entries_roundtrip() {
        let mut builder = CpkBuilder::new(1).compress(true);
        let big = vec![b'x'; 0x2000];
        builder.add("", "big.bin", big.clone());
        builder.add("", "tiny.bin", vec![1, 2, 3]);
        let raw = builder.build().unwrap();

        let cpk = Cpk::parse(&raw).unwrap();
        let entries = cpk.entries().unwrap();
        let big_entry = entries.iter().find(|e| e.name == "big.bin").unwrap();
        assert!(big_entry.is_compressed());
        assert_eq!(cpk.read_entry(big_entry).unwrap(), big);

        let tiny = entries.iter().find(|e| e.name == "tiny.bin").unwrap();
        assert!(!tiny.is_compressed());
        assert_eq!(cpk.read_entry(tiny).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn mode0_numeric_layout() {
        let mut builder = CpkBuilder::new(0);
        builder.add("", "2", vec![2; 0x10]);
        builder.add("", "0", vec![0; 0x10]);
        builder.add("", "1", vec![1u8; 0x10000 + 5]);
        let raw = builder.build().unwrap();

        let cpk = Cpk::parse(&raw).unwrap();
        assert_eq!(cpk.mode(), 0);
        let entries = cpk.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "0");
        assert_eq!(cpk.read_entry(&entries[0]).unwrap(), vec![0; 0x10]);
        // The large file lands in DataH.
        assert_eq!(entries[1].file_size, 0x10005);
        assert_eq!(cpk.read_entry(&entries[1]).unwrap(), vec![1u8; 0x10005]);
        assert_eq!(cpk.read_entry(&entries[2]).unwrap(), vec![2; 0x10]);
    }

    #[test]
    fn mode0_rejects_compression_and_names() {
        let mut builder = CpkBuilder::new(0).compress(true);
        builder.add("", "0", vec![0; 4]);
        assert!(matches!(
            builder.build(),
            Err(CriError::UnsupportedFormat { .. })
        ));

        let mut builder = CpkBuilder::new(0);
        builder.add("", "not-a-number", vec![0; 4]);
        assert!(builder.build().is_err());
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!(matches!(
            CpkBuilder::new(9).build(),
            Err(CriError::UnsupportedFormat { .. })
        ));
    }
}
