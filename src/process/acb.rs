//! ACB cue bank resolver.
//!
//! An ACB is one big @UTF table whose `bytes` cells hold further @UTF
//! tables (CueTable, CueNameTable, WaveformTable, SequenceTable, ...)
//! and, for a memory bank, the AFS2 blob itself in `AwbFile`. Sub-tables
//! are parsed on first access rather than stored recursively.
//!
//! Cue resolution follows the reference chain: names come from
//! CueNameTable, and each cue dispatches on its own CueTable row's
//! `ReferenceType` (1 maps waveforms onto AWB entries in order, 3
//! expands SequenceTable track indices; 2 and 8 are not implemented).
//! A name/entry count mismatch falls back to numeric names.

use crate::structs::awb::{Awb, AwbBuilder};
use crate::structs::chunk::{UTF_ENCRYPTED_MAGIC, UTF_MAGIC};
use crate::structs::utf::{CellValue, UtfBuilder, UtfTable};
use crate::utils::errors::{CriError, Result};

/// One resolved waveform with its cue-derived file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CueFile {
    pub name: String,
    pub encode_type: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Acb {
    pub root: UtfTable,
}

impl Acb {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            root: UtfTable::parse(data)?,
        })
    }

    pub fn name(&self) -> Result<&str> {
        self.root.string(0, "Name")
    }

    /// True when a `bytes` cell holds a nested table.
    pub fn is_table_payload(payload: &[u8]) -> bool {
        payload.len() >= 4
            && (&payload[..4] == UTF_MAGIC || &payload[..4] == UTF_ENCRYPTED_MAGIC)
    }

    /// Parses the nested table stored in root row 0's `column`.
    pub fn sub_table(&self, column: &str) -> Result<UtfTable> {
        let payload = self.root.bytes(0, column)?;
        if !Self::is_table_payload(payload) {
            return Err(CriError::invalid(
                format!("{column} does not hold a nested table"),
                0,
            ));
        }
        UtfTable::parse(payload)
    }

    /// The bank's AWB: embedded `AwbFile` blob, or the caller-supplied
    /// sibling `<Name>.awb` bytes.
    pub fn awb(&self, sibling: Option<&[u8]>) -> Result<Awb> {
        let embedded = self.root.bytes(0, "AwbFile").unwrap_or(&[]);
        if !embedded.is_empty() {
            return Awb::parse(embedded);
        }
        match sibling {
            Some(data) => Awb::parse(data),
            None => Err(CriError::invalid(
                format!(
                    "no embedded AWB; supply the sibling {}.awb",
                    self.name().unwrap_or("<bank>")
                ),
                0,
            )),
        }
    }

    /// File names aligned to the AWB's entries.
    pub fn resolve(&self, awb: &Awb) -> Result<Vec<String>> {
        let cue_names = self.sub_table("CueNameTable")?;
        let cue_table = self.sub_table("CueTable")?;

        for row in 0..cue_table.row_count() {
            let rt = cue_table.number(row, "ReferenceType").unwrap_or(1);
            if rt == 2 || rt == 8 {
                return Err(CriError::unsupported(format!("ACB ReferenceType {rt}")));
            }
        }

        // Names ordered by where their cue index sits in the AWB.
        let mut names: Vec<(u64, String)> = (0..cue_names.row_count())
            .map(|row| {
                Ok((
                    cue_names.number(row, "CueIndex")?,
                    cue_names.string(row, "CueName")?.to_owned(),
                ))
            })
            .collect::<Result<_>>()?;
        names.sort_by_key(|(index, _)| {
            awb.ids
                .iter()
                .position(|id| id == index)
                .map(|p| p as u64)
                .unwrap_or(*index)
        });

        // Each cue name dispatches on its own CueTable row.
        let mut sequences: Option<UtfTable> = None;
        let mut files = Vec::new();
        for (cue_index, name) in &names {
            let row = *cue_index as usize;
            let reference_type = if row < cue_table.row_count() {
                cue_table.number(row, "ReferenceType").unwrap_or(1)
            } else {
                1
            };
            if reference_type == 3 {
                if sequences.is_none() {
                    sequences = Some(self.sub_table("SequenceTable")?);
                }
                let sequences = sequences.as_ref().expect("parsed above");
                let indices = if row < sequences.row_count() {
                    sequences.bytes(row, "TrackIndex").unwrap_or(&[])
                } else {
                    &[]
                };
                for pair in indices.chunks_exact(2) {
                    files.push(format!("{name}_{}", u16::from_be_bytes([pair[0], pair[1]])));
                }
            } else {
                files.push(name.clone());
            }
        }

        // Count mismatches degrade to numeric names.
        for index in files.len()..awb.len() {
            files.push(index.to_string());
        }
        Ok(files)
    }

    /// Pairs every AWB entry with its resolved name and waveform encode
    /// type (2 = ADX, 4 = HCA).
    pub fn extract(&self, sibling_awb: Option<&[u8]>) -> Result<Vec<CueFile>> {
        let awb = self.awb(sibling_awb)?;
        let names = self.resolve(&awb)?;
        let waveforms = self.sub_table("WaveformTable")?;

        let mut out = Vec::with_capacity(awb.len());
        for (index, (id, data)) in awb.entries().enumerate() {
            let row = (0..waveforms.row_count())
                .find(|&row| {
                    waveforms
                        .number(row, "MemoryAwbId")
                        .or_else(|_| waveforms.number(row, "Id"))
                        .ok()
                        == Some(id)
                })
                .unwrap_or(index);
            out.push(CueFile {
                name: names[index].clone(),
                encode_type: waveforms.number(row, "EncodeType").unwrap_or(0),
                data: data.to_vec(),
            });
        }
        Ok(out)
    }
}

/// Minimal memory-ACB emitter: named cues over an embedded (or sibling)
/// AFS2 bank, ReferenceType 1 throughout.
#[derive(Debug, Clone, Default)]
pub struct AcbBuilder {
    name: String,
    cues: Vec<(String, u8, Vec<u8>)>,
}

impl AcbBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cues: Vec::new(),
        }
    }

    /// Adds a cue; `encode_type` 2 for ADX payloads, 4 for HCA.
    pub fn push_cue(&mut self, name: impl Into<String>, encode_type: u8, data: Vec<u8>) -> &mut Self {
        self.cues.push((name.into(), encode_type, data));
        self
    }

    /// Emits a memory ACB with the bank embedded in `AwbFile`.
    pub fn build(&self) -> Result<Vec<u8>> {
        let awb = self.bank()?;
        self.emit_root(awb)
    }

    /// Emits the streaming pair: the ACB with an empty `AwbFile` cell and
    /// the sibling `<name>.awb` contents.
    pub fn build_external(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let awb = self.bank()?;
        let acb = self.emit_root(Vec::new())?;
        Ok((acb, awb))
    }

    fn bank(&self) -> Result<Vec<u8>> {
        let mut bank = AwbBuilder::new();
        for (_, _, data) in &self.cues {
            bank.push(data.clone());
        }
        bank.build()
    }

    fn emit_root(&self, awb: Vec<u8>) -> Result<Vec<u8>> {
        if self.cues.is_empty() {
            return Err(CriError::invalid("ACB build with no cues", 0));
        }

        let mut waveforms = UtfBuilder::new("Waveform");
        let mut cue_table = UtfBuilder::new("Cue");
        let mut cue_names = UtfBuilder::new("CueName");
        for (index, (name, encode_type, _)) in self.cues.iter().enumerate() {
            waveforms.push_row(vec![
                ("Id".into(), CellValue::U16(index as u16)),
                ("MemoryAwbId".into(), CellValue::U16(index as u16)),
                ("EncodeType".into(), CellValue::U8(*encode_type)),
                ("Streaming".into(), CellValue::U8(0)),
            ]);
            cue_table.push_row(vec![
                ("CueId".into(), CellValue::U32(index as u32)),
                ("ReferenceType".into(), CellValue::U8(1)),
                ("ReferenceIndex".into(), CellValue::U16(index as u16)),
            ]);
            cue_names.push_row(vec![
                ("CueName".into(), CellValue::Str(name.clone())),
                ("CueIndex".into(), CellValue::U16(index as u16)),
            ]);
        }

        let mut root = UtfBuilder::new("Header");
        root.push_row(vec![
            ("Name".into(), CellValue::Str(self.name.clone())),
            ("CueTable".into(), CellValue::Bytes(cue_table.build()?)),
            ("CueNameTable".into(), CellValue::Bytes(cue_names.build()?)),
            ("WaveformTable".into(), CellValue::Bytes(waveforms.build()?)),
            ("AwbFile".into(), CellValue::Bytes(awb)),
        ]);
        root.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AcbBuilder {
        let mut builder = AcbBuilder::new("voices");
        builder.push_cue("intro", 2, vec![0xA0; 0x30]);
        builder.push_cue("battle", 4, vec![0xB1; 0x11]);
        builder.push_cue("ending", 4, vec![0xC2; 0x42]);
        builder
    }

    #[test]
    fn memory_bank_roundtrip() {
        let acb = Acb::parse(&sample().build().unwrap()).unwrap();
        assert_eq!(acb.name().unwrap(), "voices");

        let files = acb.extract(None).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].name, "intro");
        assert_eq!(files[0].encode_type, 2);
        assert_eq!(files[0].data, vec![0xA0; 0x30]);
        assert_eq!(files[2].name, "ending");
        assert_eq!(files[2].data, vec![0xC2; 0x42]);
    }

    #[test]
    fn external_bank_requires_sibling() {
        let (acb_bytes, awb_bytes) = sample().build_external().unwrap();
        let acb = Acb::parse(&acb_bytes).unwrap();
        assert!(acb.extract(None).is_err());

        let files = acb.extract(Some(&awb_bytes)).unwrap();
        assert_eq!(files[1].name, "battle");
        assert_eq!(files[1].encode_type, 4);
        assert_eq!(files[1].data, vec![0xB1; 0x11]);
    }

    #[test]
    fn nested_cells_detected() {
        let acb = Acb::parse(&sample().build().unwrap()).unwrap();
        assert!(Acb::is_table_payload(acb.root.bytes(0, "CueTable").unwrap()));
        assert!(!Acb::is_table_payload(acb.root.bytes(0, "AwbFile").unwrap()));
        let cues = acb.sub_table("CueTable").unwrap();
        assert_eq!(cues.row_count(), 3);
        assert_eq!(cues.number(1, "ReferenceType").unwrap(), 1);
    }

    fn root_with_reference_types(
        types: [u8; 2],
        track_index: Option<[Vec<u8>; 2]>,
    ) -> Vec<u8> {
        let mut bank = AwbBuilder::new();
        bank.push(vec![1; 8]);
        bank.push(vec![2; 8]);

        let mut cue_table = UtfBuilder::new("Cue");
        let mut cue_names = UtfBuilder::new("CueName");
        let mut waveforms = UtfBuilder::new("Waveform");
        for index in 0..2u16 {
            cue_table.push_row(vec![
                ("CueId".into(), CellValue::U32(u32::from(index))),
                (
                    "ReferenceType".into(),
                    CellValue::U8(types[usize::from(index)]),
                ),
                ("ReferenceIndex".into(), CellValue::U16(index)),
            ]);
            cue_names.push_row(vec![
                ("CueName".into(), CellValue::Str(format!("cue{index}"))),
                ("CueIndex".into(), CellValue::U16(index)),
            ]);
            waveforms.push_row(vec![
                ("Id".into(), CellValue::U16(index)),
                ("EncodeType".into(), CellValue::U8(2)),
            ]);
        }

        let mut row = vec![
            ("Name".into(), CellValue::Str("pair".into())),
            ("CueTable".into(), CellValue::Bytes(cue_table.build().unwrap())),
            ("CueNameTable".into(), CellValue::Bytes(cue_names.build().unwrap())),
            ("WaveformTable".into(), CellValue::Bytes(waveforms.build().unwrap())),
            ("AwbFile".into(), CellValue::Bytes(bank.build().unwrap())),
        ];
        if let Some([first, second]) = track_index {
            let mut sequences = UtfBuilder::new("Sequence");
            sequences.push_row(vec![("TrackIndex".into(), CellValue::Bytes(first))]);
            sequences.push_row(vec![("TrackIndex".into(), CellValue::Bytes(second))]);
            row.push((
                "SequenceTable".into(),
                CellValue::Bytes(sequences.build().unwrap()),
            ));
        }
        let mut builder = UtfBuilder::new("Header");
        builder.push_row(row);
        builder.build().unwrap()
    }

    #[test]
    fn sequence_reference_expands_tracks() {
        // Two tracks under the first cue name: big-endian u16 pairs.
        let raw = root_with_reference_types([3, 3], Some([vec![0, 0, 0, 1], vec![]]));
        let acb = Acb::parse(&raw).unwrap();
        let files = acb.extract(None).unwrap();
        assert_eq!(files[0].name, "cue0_0");
        assert_eq!(files[1].name, "cue0_1");
    }

    #[test]
    fn mixed_reference_types_dispatch_per_cue() {
        // Cue 0 resolves directly, cue 1 goes through its sequence row.
        let raw = root_with_reference_types([1, 3], Some([vec![], vec![0, 2]]));
        let acb = Acb::parse(&raw).unwrap();
        let files = acb.extract(None).unwrap();
        assert_eq!(files[0].name, "cue0");
        assert_eq!(files[1].name, "cue1_2");
    }

    #[test]
    fn reference_types_2_and_8_unsupported() {
        for rt in [2u8, 8] {
            let raw = root_with_reference_types([rt, rt], None);
            let acb = Acb::parse(&raw).unwrap();
            assert!(matches!(
                acb.extract(None),
                Err(CriError::UnsupportedFormat { .. })
            ));
        }
    }

    #[test]
    fn count_mismatch_uses_numeric_names() {
        let mut builder = AcbBuilder::new("short");
        builder.push_cue("only", 2, vec![5; 4]);
        let acb = Acb::parse(&builder.build().unwrap()).unwrap();
        // Drop one cue name by rebuilding names for a 1-cue table while
        // the bank keeps two entries.
        let mut bank = AwbBuilder::new();
        bank.push(vec![5; 4]);
        bank.push(vec![6; 4]);
        let names = acb.resolve(&Awb::parse(&bank.build().unwrap()).unwrap()).unwrap();
        assert_eq!(names, vec!["only".to_string(), "1".to_string()]);
    }
}
