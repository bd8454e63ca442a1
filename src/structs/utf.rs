//! @UTF table codec.
//!
//! @UTF is the typed tabular metadata format the rest of the family is
//! built out of: CPK directories, ACB cue banks and USM stream
//! descriptions are all @UTF tables, sometimes nested inside each other.
//!
//! A table is big-endian: a 0x20-byte header, a column descriptor block,
//! a row block, a string pool and a binary pool. All header offsets are
//! relative to byte 8 (everything after the magic and the table size).
//! Each column carries a storage flag: `zero` cells occupy no storage,
//! `constant` cells live once in the column descriptor, `per-row` cells
//! live in the row block.
//!
//! An encrypted table starts with `1F 9E F3 F5` instead of `@UTF`; the
//! whole blob is XORed with a `(0x655F, 0x4115)` multiplicative
//! keystream.

use crate::structs::chunk::{UTF_ENCRYPTED_MAGIC, UTF_MAGIC};
use crate::utils::bytes::{ByteReader, WriteBytesBe, align_up, pad_to, read_cstr};
use crate::utils::errors::{CriError, Result};

const HEADER_SIZE: usize = 0x20;
/// Offset of the table name inside the pool: right past `"<NULL>\0"`.
const NAME_OFFSET: u32 = 7;

/// Column value type, as encoded in the low nibble of the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    U8 = 0x0,
    I8 = 0x1,
    U16 = 0x2,
    I16 = 0x3,
    U32 = 0x4,
    I32 = 0x5,
    U64 = 0x6,
    I64 = 0x7,
    F32 = 0x8,
    F64 = 0x9,
    Str = 0xA,
    Bytes = 0xB,
}

impl ColumnType {
    pub fn from_code(code: u8, offset: usize) -> Result<Self> {
        Ok(match code {
            0x0 => Self::U8,
            0x1 => Self::I8,
            0x2 => Self::U16,
            0x3 => Self::I16,
            0x4 => Self::U32,
            0x5 => Self::I32,
            0x6 => Self::U64,
            0x7 => Self::I64,
            0x8 => Self::F32,
            0x9 => Self::F64,
            0xA => Self::Str,
            0xB => Self::Bytes,
            other => {
                return Err(CriError::invalid(
                    format!("unknown @UTF type code {other:#X}"),
                    offset,
                ));
            }
        })
    }

    /// In-row footprint in bytes (strings store a pool offset, bytes an
    /// offset/length pair).
    pub fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 | Self::Str => 4,
            Self::U64 | Self::I64 | Self::F64 | Self::Bytes => 8,
        }
    }
}

/// Per-column storage election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Storage {
    /// No stored value; cells read back as the type's zero.
    Zero = 0x1,
    /// One value in the column descriptor, shared by all rows.
    Constant = 0x3,
    /// One value per row in the row block.
    PerRow = 0x5,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub storage: Storage,
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl CellValue {
    pub fn ty(&self) -> ColumnType {
        match self {
            Self::U8(_) => ColumnType::U8,
            Self::I8(_) => ColumnType::I8,
            Self::U16(_) => ColumnType::U16,
            Self::I16(_) => ColumnType::I16,
            Self::U32(_) => ColumnType::U32,
            Self::I32(_) => ColumnType::I32,
            Self::U64(_) => ColumnType::U64,
            Self::I64(_) => ColumnType::I64,
            Self::F32(_) => ColumnType::F32,
            Self::F64(_) => ColumnType::F64,
            Self::Str(_) => ColumnType::Str,
            Self::Bytes(_) => ColumnType::Bytes,
        }
    }

    pub fn zero(ty: ColumnType) -> Self {
        match ty {
            ColumnType::U8 => Self::U8(0),
            ColumnType::I8 => Self::I8(0),
            ColumnType::U16 => Self::U16(0),
            ColumnType::I16 => Self::I16(0),
            ColumnType::U32 => Self::U32(0),
            ColumnType::I32 => Self::I32(0),
            ColumnType::U64 => Self::U64(0),
            ColumnType::I64 => Self::I64(0),
            ColumnType::F32 => Self::F32(0.0),
            ColumnType::F64 => Self::F64(0.0),
            ColumnType::Str => Self::Str(String::new()),
            ColumnType::Bytes => Self::Bytes(Vec::new()),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Self::U8(v) => *v == 0,
            Self::I8(v) => *v == 0,
            Self::U16(v) => *v == 0,
            Self::I16(v) => *v == 0,
            Self::U32(v) => *v == 0,
            Self::I32(v) => *v == 0,
            Self::U64(v) => *v == 0,
            Self::I64(v) => *v == 0,
            Self::F32(v) => *v == 0.0,
            Self::F64(v) => *v == 0.0,
            Self::Str(v) => v.is_empty(),
            Self::Bytes(v) => v.is_empty(),
        }
    }

    /// Widening integer projection; `None` for floats, strings, bytes and
    /// negative values.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U8(v) => Some(u64::from(*v)),
            Self::U16(v) => Some(u64::from(*v)),
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            Self::I8(v) => u64::try_from(*v).ok(),
            Self::I16(v) => u64::try_from(*v).ok(),
            Self::I32(v) => u64::try_from(*v).ok(),
            Self::I64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::U8(v) => Some(i64::from(*v)),
            Self::U16(v) => Some(i64::from(*v)),
            Self::U32(v) => Some(i64::from(*v)),
            Self::U64(v) => i64::try_from(*v).ok(),
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

/// Applies the whole-table XOR keystream in place. Encryption and
/// decryption are the same operation.
pub fn crypt_in_place(data: &mut [u8]) {
    let mut m: u32 = 0x655F;
    const T: u32 = 0x4115;
    for b in data.iter_mut() {
        *b ^= (m & 0xFF) as u8;
        m = m.wrapping_mul(T);
    }
}

/// A fully materialized @UTF table: schema plus rows in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct UtfTable {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<CellValue>>,
}

impl UtfTable {
    /// Parses a table from the start of `data`, transparently decrypting
    /// the XOR-masked variant. Trailing bytes past the declared table
    /// size are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() >= 4 && &data[..4] == UTF_ENCRYPTED_MAGIC {
            let mut plain = data.to_vec();
            crypt_in_place(&mut plain);
            if &plain[..4] != UTF_MAGIC {
                return Err(CriError::invalid("@UTF decryption produced bad magic", 0));
            }
            return Self::parse_plain(&plain);
        }
        Self::parse_plain(data)
    }

    fn parse_plain(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        r.expect_magic(UTF_MAGIC)?;
        let table_size = r.u32_be()? as usize;
        let rows_offset = r.u32_be()? as usize;
        let string_offset = r.u32_be()? as usize;
        let data_offset = r.u32_be()? as usize;
        let name_offset = r.u32_be()?;
        let column_count = r.u16_be()? as usize;
        let row_length = r.u16_be()? as usize;
        let row_count = r.u32_be()? as usize;

        let end = 8 + table_size;
        if end > data.len()
            || !(HEADER_SIZE - 8 <= rows_offset
                && rows_offset <= string_offset
                && string_offset <= data_offset
                && data_offset <= table_size)
        {
            return Err(CriError::invalid("@UTF region offsets out of order", 4));
        }

        let pool = &data[8 + string_offset..8 + data_offset];
        let binary = &data[8 + data_offset..end];

        let mut columns = Vec::with_capacity(column_count);
        let mut constants: Vec<Option<CellValue>> = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let flag_pos = r.pos();
            let flag = r.u8()?;
            let ty = ColumnType::from_code(flag & 0xF, flag_pos)?;
            let storage = match flag >> 4 {
                0x1 => Storage::Zero,
                0x3 => Storage::Constant,
                0x5 => Storage::PerRow,
                0x7 => {
                    return Err(CriError::unsupported(
                        "@UTF per-row storage flag 0x7 with inline default",
                    ));
                }
                other => {
                    return Err(CriError::invalid(
                        format!("unknown @UTF storage flag {other:#X}"),
                        flag_pos,
                    ));
                }
            };
            let name = read_cstr(pool, r.u32_be()? as usize)?;
            let constant = match storage {
                Storage::Constant => Some(read_cell(&mut r, ty, pool, binary)?),
                _ => None,
            };
            columns.push(Column { name, ty, storage });
            constants.push(constant);
        }

        let per_row_width: usize = columns
            .iter()
            .filter(|c| c.storage == Storage::PerRow)
            .map(|c| c.ty.width())
            .sum();
        if per_row_width != row_length {
            return Err(CriError::invalid(
                format!("@UTF row length {row_length} != per-row footprint {per_row_width}"),
                0x1A,
            ));
        }

        let name = read_cstr(pool, name_offset as usize)?;

        let mut rows = Vec::with_capacity(row_count);
        let mut row_reader = ByteReader::at(data, 8 + rows_offset);
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(column_count);
            for (column, constant) in columns.iter().zip(&constants) {
                let cell = match column.storage {
                    Storage::Zero => CellValue::zero(column.ty),
                    Storage::Constant => constant.clone().expect("constant cell present"),
                    Storage::PerRow => read_cell(&mut row_reader, column.ty, pool, binary)?,
                };
                row.push(cell);
            }
            rows.push(row);
        }

        Ok(Self {
            name,
            columns,
            rows,
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.index_of(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Widening integer lookup; `InvalidData` when the cell is missing or
    /// not an integer.
    pub fn number(&self, row: usize, column: &str) -> Result<u64> {
        self.get(row, column)
            .and_then(CellValue::as_u64)
            .ok_or_else(|| CriError::invalid(format!("missing numeric cell {column}"), 0))
    }

    pub fn string(&self, row: usize, column: &str) -> Result<&str> {
        self.get(row, column)
            .and_then(CellValue::as_str)
            .ok_or_else(|| CriError::invalid(format!("missing string cell {column}"), 0))
    }

    pub fn bytes(&self, row: usize, column: &str) -> Result<&[u8]> {
        self.get(row, column)
            .and_then(CellValue::as_bytes)
            .ok_or_else(|| CriError::invalid(format!("missing bytes cell {column}"), 0))
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.index_of(column).is_some()
    }
}

fn read_cell(r: &mut ByteReader, ty: ColumnType, pool: &[u8], binary: &[u8]) -> Result<CellValue> {
    Ok(match ty {
        ColumnType::U8 => CellValue::U8(r.u8()?),
        ColumnType::I8 => CellValue::I8(r.i8()?),
        ColumnType::U16 => CellValue::U16(r.u16_be()?),
        ColumnType::I16 => CellValue::I16(r.i16_be()?),
        ColumnType::U32 => CellValue::U32(r.u32_be()?),
        ColumnType::I32 => CellValue::I32(r.i32_be()?),
        ColumnType::U64 => CellValue::U64(r.u64_be()?),
        ColumnType::I64 => CellValue::I64(r.i64_be()?),
        ColumnType::F32 => CellValue::F32(r.f32_be()?),
        ColumnType::F64 => CellValue::F64(r.f64_be()?),
        ColumnType::Str => {
            let offset = r.u32_be()? as usize;
            // Offset 0 is the <NULL> sentinel: the empty string.
            if offset == 0 {
                CellValue::Str(String::new())
            } else {
                CellValue::Str(read_cstr(pool, offset)?)
            }
        }
        ColumnType::Bytes => {
            let pos = r.pos();
            let offset = r.u32_be()? as usize;
            let len = r.u32_be()? as usize;
            let end = offset
                .checked_add(len)
                .filter(|&e| e <= binary.len())
                .ok_or_else(|| CriError::invalid("bytes reference past binary pool", pos))?;
            CellValue::Bytes(binary[offset..end].to_vec())
        }
    })
}

/// Builds @UTF tables from rows of `(column name, value)` pairs.
///
/// All rows must share one `(name, type)` schema in the same order.
/// Storage flags are elected per column: a value equal on every row is
/// stored once (`constant`), or not at all when it is the type's zero;
/// single-row tables never use `constant`.
#[derive(Debug, Clone)]
pub struct UtfBuilder {
    name: String,
    encrypt: bool,
    rows: Vec<Vec<(String, CellValue)>>,
}

impl UtfBuilder {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            name: table_name.into(),
            encrypt: false,
            rows: Vec::new(),
        }
    }

    pub fn encrypted(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn push_row(&mut self, row: Vec<(String, CellValue)>) -> &mut Self {
        let row = row
            .into_iter()
            .map(|(name, value)| match value {
                // Legacy in-band marker for the empty string.
                CellValue::Str(s) if s == "<NULL>" => (name, CellValue::Str(String::new())),
                other => (name, other),
            })
            .collect();
        self.rows.push(row);
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if self.rows.is_empty() {
            return Err(CriError::invalid("@UTF build with no rows", 0));
        }

        let schema: Vec<(&str, ColumnType)> = self.rows[0]
            .iter()
            .map(|(name, value)| (name.as_str(), value.ty()))
            .collect();
        for row in &self.rows[1..] {
            let this: Vec<(&str, ColumnType)> = row
                .iter()
                .map(|(name, value)| (name.as_str(), value.ty()))
                .collect();
            if this != schema {
                return Err(CriError::invalid("heterogeneous @UTF row schemas", 0));
            }
        }

        let storages: Vec<Storage> = (0..schema.len())
            .map(|col| {
                let first = &self.rows[0][col].1;
                let all_equal = self.rows.iter().all(|row| &row[col].1 == first);
                if self.rows.len() == 1 {
                    if first.is_zero() { Storage::Zero } else { Storage::PerRow }
                } else if !all_equal {
                    Storage::PerRow
                } else if first.is_zero() {
                    Storage::Zero
                } else {
                    Storage::Constant
                }
            })
            .collect();

        let (pool, string_offsets) = self.build_string_pool();
        let binary = self.build_binary_pool();

        let string_at = |s: &str| -> u32 {
            if s.is_empty() {
                0
            } else {
                *string_offsets
                    .iter()
                    .find(|(name, _)| name == s)
                    .map(|(_, off)| off)
                    .expect("string interned")
            }
        };
        let binary_at = |b: &[u8]| -> u32 {
            if b.is_empty() {
                0
            } else {
                find_subslice(&binary, b).expect("binary interned") as u32
            }
        };

        let write_value = |dst: &mut Vec<u8>, value: &CellValue| match value {
            CellValue::U8(v) => v.write_be(dst),
            CellValue::I8(v) => v.write_be(dst),
            CellValue::U16(v) => v.write_be(dst),
            CellValue::I16(v) => v.write_be(dst),
            CellValue::U32(v) => v.write_be(dst),
            CellValue::I32(v) => v.write_be(dst),
            CellValue::U64(v) => v.write_be(dst),
            CellValue::I64(v) => v.write_be(dst),
            CellValue::F32(v) => v.write_be(dst),
            CellValue::F64(v) => v.write_be(dst),
            CellValue::Str(v) => string_at(v).write_be(dst),
            CellValue::Bytes(v) => {
                binary_at(v).write_be(dst);
                (v.len() as u32).write_be(dst);
            }
        };

        let mut column_block = Vec::new();
        for (col, (name, ty)) in schema.iter().enumerate() {
            column_block.push((storages[col] as u8) << 4 | *ty as u8);
            string_at(name).write_be(&mut column_block);
            if storages[col] == Storage::Constant {
                write_value(&mut column_block, &self.rows[0][col].1);
            }
        }

        let mut row_block = Vec::new();
        for row in &self.rows {
            for (col, (_, value)) in row.iter().enumerate() {
                if storages[col] == Storage::PerRow {
                    write_value(&mut row_block, value);
                }
            }
        }
        let row_length: usize = schema
            .iter()
            .enumerate()
            .filter(|(col, _)| storages[*col] == Storage::PerRow)
            .map(|(_, (_, ty))| ty.width())
            .sum();

        let body_len = 0x18 + column_block.len() + row_block.len() + pool.len() + binary.len();
        let table_size = align_up(body_len as u64, 8) as u32;
        let rows_offset = (0x18 + column_block.len()) as u32;
        let string_offset = rows_offset + row_block.len() as u32;
        let data_offset = if binary.is_empty() {
            table_size
        } else {
            (body_len - binary.len()) as u32
        };

        let mut out = Vec::with_capacity(8 + table_size as usize);
        out.extend_from_slice(UTF_MAGIC);
        table_size.write_be(&mut out);
        rows_offset.write_be(&mut out);
        string_offset.write_be(&mut out);
        data_offset.write_be(&mut out);
        NAME_OFFSET.write_be(&mut out);
        (schema.len() as u16).write_be(&mut out);
        (row_length as u16).write_be(&mut out);
        (self.rows.len() as u32).write_be(&mut out);
        out.extend_from_slice(&column_block);
        out.extend_from_slice(&row_block);
        out.extend_from_slice(&pool);
        out.extend_from_slice(&binary);
        pad_to(&mut out, 8 + table_size as usize);

        if self.encrypt {
            crypt_in_place(&mut out);
        }
        Ok(out)
    }

    /// Pool layout: `<NULL>`, the table name, then every distinct
    /// non-empty string in order of first appearance (column name before
    /// cell value, row-major).
    fn build_string_pool(&self) -> (Vec<u8>, Vec<(String, u32)>) {
        let mut interned: Vec<String> = vec!["<NULL>".into(), self.name.clone()];
        let mut intern = |interned: &mut Vec<String>, s: &str| {
            if !s.is_empty() && !interned.iter().any(|x| x == s) {
                interned.push(s.to_owned());
            }
        };
        for row in &self.rows {
            for (name, value) in row {
                intern(&mut interned, name);
                if let CellValue::Str(s) = value {
                    intern(&mut interned, s);
                }
            }
        }

        let mut pool = Vec::new();
        let mut offsets = Vec::with_capacity(interned.len());
        for s in interned {
            offsets.push((s.clone(), pool.len() as u32));
            pool.extend_from_slice(s.as_bytes());
            pool.push(0);
        }
        (pool, offsets)
    }

    /// Binary pool with containment-level dedup: a payload already
    /// present as a subslice is referenced instead of appended.
    fn build_binary_pool(&self) -> Vec<u8> {
        let mut pool = Vec::new();
        for row in &self.rows {
            for (_, value) in row {
                if let CellValue::Bytes(b) = value {
                    if !b.is_empty() && find_subslice(&pool, b).is_none() {
                        pool.extend_from_slice(b);
                    }
                }
            }
        }
        pool
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_row_table() -> UtfBuilder {
        let mut builder = UtfBuilder::new("Ex");
        builder.push_row(vec![("Id".into(), CellValue::U32(1))]);
        builder.push_row(vec![("Id".into(), CellValue::U32(2))]);
        builder
    }

    #[test]
    fn minimal_table_layout() {
        let raw = two_row_table().build().unwrap();
        assert_eq!(&raw[..4], b"@UTF");
        // column_count, row_length, row_count straight from the header.
        assert_eq!(u16::from_be_bytes([raw[0x18], raw[0x19]]), 1);
        assert_eq!(u16::from_be_bytes([raw[0x1A], raw[0x1B]]), 4);
        assert_eq!(
            u32::from_be_bytes([raw[0x1C], raw[0x1D], raw[0x1E], raw[0x1F]]),
            2
        );

        let table = UtfTable::parse(&raw).unwrap();
        assert_eq!(table.name, "Ex");
        assert_eq!(table.rows[1][0], CellValue::U32(2));
        assert_eq!(table.columns[0].storage, Storage::PerRow);
    }

    #[test]
    fn pool_starts_with_sentinel_and_name() {
        let raw = two_row_table().build().unwrap();
        let string_offset = u32::from_be_bytes([raw[0xC], raw[0xD], raw[0xE], raw[0xF]]) as usize;
        assert!(raw[8 + string_offset..].starts_with(b"<NULL>\0Ex\0Id\0"));
    }

    #[test]
    fn logical_roundtrip_all_types() {
        let mut builder = UtfBuilder::new("AllTypes");
        for i in 0..3i64 {
            builder.push_row(vec![
                ("A".into(), CellValue::U8(i as u8)),
                ("B".into(), CellValue::I16(-(i as i16))),
                ("C".into(), CellValue::U64(0xDEAD_BEEF + i as u64)),
                ("D".into(), CellValue::F32(1.5)),
                ("E".into(), CellValue::Str(format!("row{i}"))),
                ("F".into(), CellValue::Bytes(vec![i as u8; 4])),
                ("G".into(), CellValue::U32(0)),
                ("H".into(), CellValue::Str(String::new())),
            ]);
        }
        let raw = builder.build().unwrap();
        let once = UtfTable::parse(&raw).unwrap();

        // Shared F32 becomes a constant; zero columns vanish from rows.
        assert_eq!(once.columns[3].storage, Storage::Constant);
        assert_eq!(once.columns[6].storage, Storage::Zero);
        assert_eq!(once.columns[7].storage, Storage::Zero);

        let mut again = UtfBuilder::new(&once.name);
        for row in &once.rows {
            again.push_row(
                once.columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.name.clone(), v.clone()))
                    .collect(),
            );
        }
        let twice = UtfTable::parse(&again.build().unwrap()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn keystream_roundtrip() {
        let mut data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let original = data.clone();
        crypt_in_place(&mut data);
        assert_ne!(data, original);
        crypt_in_place(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn encrypted_table_parses() {
        let raw = two_row_table().encrypted(true).build().unwrap();
        assert_eq!(&raw[..4], UTF_ENCRYPTED_MAGIC);
        let table = UtfTable::parse(&raw).unwrap();
        assert_eq!(table.number(0, "Id").unwrap(), 1);
    }

    #[test]
    fn heterogeneous_schema_rejected() {
        let mut builder = UtfBuilder::new("Bad");
        builder.push_row(vec![("Id".into(), CellValue::U32(1))]);
        builder.push_row(vec![("Id".into(), CellValue::U16(2))]);
        assert!(matches!(
            builder.build(),
            Err(CriError::InvalidData { .. })
        ));
    }

    #[test]
    fn single_row_never_constant() {
        let mut builder = UtfBuilder::new("One");
        builder.push_row(vec![
            ("A".into(), CellValue::U32(7)),
            ("B".into(), CellValue::U32(0)),
        ]);
        let table = UtfTable::parse(&builder.build().unwrap()).unwrap();
        assert_eq!(table.columns[0].storage, Storage::PerRow);
        assert_eq!(table.columns[1].storage, Storage::Zero);
    }

    #[test]
    fn null_marker_reads_back_empty() {
        let mut builder = UtfBuilder::new("T");
        builder.push_row(vec![("S".into(), CellValue::Str("<NULL>".into()))]);
        builder.push_row(vec![("S".into(), CellValue::Str("x".into()))]);
        let table = UtfTable::parse(&builder.build().unwrap()).unwrap();
        assert_eq!(table.string(0, "S").unwrap(), "");
        assert_eq!(table.string(1, "S").unwrap(), "x");
    }

    #[test]
    fn truncated_table_fails_with_offset() {
        let raw = two_row_table().build().unwrap();
        assert!(UtfTable::parse(&raw[..raw.len() / 2]).is_err());
    }
}
