//! CRILAYLA per-file compression.
//!
//! The stream is decoded backward: the last 0x100 bytes of the blob are
//! a verbatim copy of the file's first 0x100 bytes, and the bit stream,
//! read MSB-first from the byte at `0x10 + compressed_size - 1` toward
//! the header, fills the rest of the output from its end toward the
//! tail. A set bit introduces a backreference (13-bit distance minus 3,
//! then a {2,3,5,8}-bit length ladder with inclusive accumulation), a
//! clear bit an 8-bit literal.

use std::io::{Cursor, Read, Seek, Write};

use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};

use crate::structs::chunk::CRILAYLA_MAGIC;
use crate::utils::bytes::{ByteReader, WriteBytesLe};
use crate::utils::errors::{CriError, Result};

/// Verbatim tail length; also the size of the raw block at output start.
const TAIL: usize = 0x100;
/// Sliding window: 13 bits of stored distance plus the implicit 3.
const MAX_DISTANCE: usize = 0x1FFF + 3;
const MIN_MATCH: usize = 3;

/// Decompresses a CRILAYLA blob into its original bytes.
pub fn decompress(blob: &[u8]) -> Result<Vec<u8>> {
    let mut r = ByteReader::new(blob);
    r.expect_magic(CRILAYLA_MAGIC)?;
    let uncompressed_size = r.u32_le()? as usize;
    let compressed_size = r.u32_le()? as usize;
    if blob.len() < 0x10 + compressed_size + TAIL {
        return Err(CriError::invalid("CRILAYLA blob shorter than declared", 8));
    }

    let stream = &blob[0x10..0x10 + compressed_size];
    let tail = &blob[0x10 + compressed_size..0x10 + compressed_size + TAIL];

    let mut out = vec![0u8; TAIL + uncompressed_size];
    out[..TAIL].copy_from_slice(tail);

    // Reading the reversed stream forward is identical to walking the
    // original bytes backward, MSB to LSB in each.
    let reversed: Vec<u8> = stream.iter().rev().copied().collect();
    let mut bits = BitReader::endian(Cursor::new(reversed.as_slice()), BigEndian);

    let output_end = out.len() - 1;
    let mut written = 0usize;
    while written < uncompressed_size {
        let w = output_end - written;
        if read_bit(&mut bits)? {
            let distance = read_bits(&mut bits, 13)? as usize + MIN_MATCH;
            let mut length = MIN_MATCH;
            for (level, &width) in [2u32, 3, 5, 8].iter().enumerate() {
                let this_level = read_bits(&mut bits, width)? as usize;
                length += this_level;
                if this_level != (1 << width) - 1 {
                    break;
                }
                if level == 3 {
                    loop {
                        let ext = read_bits(&mut bits, 8)? as usize;
                        length += ext;
                        if ext != 0xFF {
                            break;
                        }
                    }
                }
            }

            let mut src = w + distance;
            if src > output_end {
                return Err(CriError::invalid(
                    "CRILAYLA backreference out of range",
                    0x10,
                ));
            }
            if length > uncompressed_size - written {
                return Err(CriError::invalid(
                    "CRILAYLA backreference overruns output",
                    0x10,
                ));
            }
            for i in 0..length {
                out[w - i] = out[src];
                src -= 1;
            }
            written += length;
        } else {
            out[w] = read_bits(&mut bits, 8)? as u8;
            written += 1;
        }
    }

    Ok(out)
}

/// Compresses `data` into a CRILAYLA blob.
///
/// The first 0x100 bytes go out verbatim as the blob tail; anything
/// shorter than that has no compressed form.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < TAIL {
        return Err(CriError::invalid(
            "CRILAYLA input shorter than the 0x100-byte raw block",
            0,
        ));
    }
    let uncompressed_size = data.len() - TAIL;

    let mut bits = BitWriter::endian(Cursor::new(Vec::<u8>::new()), BigEndian);
    let mut pos = data.len();
    while pos > TAIL {
        let w = pos - 1;
        let (distance, length) = best_match(data, w);
        if length >= MIN_MATCH {
            write_bit(&mut bits, true)?;
            write_bits(&mut bits, 13, (distance - MIN_MATCH) as u32)?;
            write_length(&mut bits, length - MIN_MATCH)?;
            pos -= length;
        } else {
            write_bit(&mut bits, false)?;
            write_bits(&mut bits, 8, u32::from(data[w]))?;
            pos -= 1;
        }
    }
    bits.byte_align().map_err(stream_error)?;
    let mut stream = bits.into_writer().into_inner();
    stream.reverse();

    let mut out = Vec::with_capacity(0x10 + stream.len() + TAIL);
    out.extend_from_slice(CRILAYLA_MAGIC);
    (uncompressed_size as u32).write_le(&mut out);
    (stream.len() as u32).write_le(&mut out);
    out.extend_from_slice(&stream);
    out.extend_from_slice(&data[..TAIL]);
    Ok(out)
}

/// Greedy longest match ending at `w`, searching distances 3..=0x2002
/// into the already-encoded suffix. Runs shorter than the minimum match
/// report length 0.
fn best_match(data: &[u8], w: usize) -> (usize, usize) {
    let cap = w + 1 - TAIL;
    let max_distance = MAX_DISTANCE.min(data.len() - 1 - w);
    let mut best = (0usize, 0usize);

    for distance in MIN_MATCH..=max_distance {
        if data[w] != data[w + distance] {
            continue;
        }
        let mut length = 1;
        while length < cap && data[w - length] == data[w + distance - length] {
            length += 1;
        }
        if length > best.1 {
            best = (distance, length);
            if length == cap {
                break;
            }
        }
    }
    best
}

/// Emits `rem = length - 3` through the {2,3,5,8}-bit ladder, mirroring
/// the decoder's inclusive accumulation.
fn write_length<W: Write + Seek>(bits: &mut BitWriter<W, BigEndian>, mut rem: usize) -> Result<()> {
    for width in [2u32, 3, 5] {
        let max = (1 << width) - 1;
        let this_level = rem.min(max);
        write_bits(bits, width, this_level as u32)?;
        if this_level != max {
            return Ok(());
        }
        rem -= this_level;
    }
    loop {
        let this_level = rem.min(0xFF);
        write_bits(bits, 8, this_level as u32)?;
        rem -= this_level;
        if this_level != 0xFF {
            return Ok(());
        }
    }
}

fn stream_error(_: std::io::Error) -> CriError {
    CriError::invalid("CRILAYLA bit stream exhausted", 0x10)
}

fn read_bit<R: Read + Seek>(bits: &mut BitReader<R, BigEndian>) -> Result<bool> {
    bits.read_bit().map_err(stream_error)
}

fn read_bits<R: Read + Seek>(bits: &mut BitReader<R, BigEndian>, n: u32) -> Result<u32> {
    bits.read_unsigned_var(n).map_err(stream_error)
}

fn write_bit<W: Write + Seek>(bits: &mut BitWriter<W, BigEndian>, bit: bool) -> Result<()> {
    bits.write_bit(bit).map_err(stream_error)
}

fn write_bits<W: Write + Seek>(bits: &mut BitWriter<W, BigEndian>, n: u32, v: u32) -> Result<()> {
    bits.write_unsigned_var(n, v).map_err(stream_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) {
        let blob = compress(data).unwrap();
        assert_eq!(decompress(&blob).unwrap(), data);
    }

    #[test]
    fn tail_only() {
        let data: Vec<u8> = (0..=255u8).collect();
        let blob = compress(&data).unwrap();
        // Nothing to encode: the blob is header plus raw block.
        assert_eq!(blob.len(), 0x10 + TAIL);
        roundtrip(&data);
    }

    #[test]
    fn repeating_input_collapses() {
        let data = vec![b'A'; 0x10000];
        let blob = compress(&data).unwrap();
        assert!(blob.len() < data.len() / 8);
        assert_eq!(decompress(&blob).unwrap(), data);
    }

    #[test]
    fn structured_input_roundtrip() {
        let mut data = Vec::new();
        for i in 0..0x600u32 {
            data.extend_from_slice(format!("record-{:04}#", i % 97).as_bytes());
        }
        roundtrip(&data);
    }

    #[test]
    fn high_entropy_roundtrip() {
        // xorshift-ish generator, deterministic and incompressible.
        let mut state = 0x1234_5678_9ABC_DEF0u64;
        let data: Vec<u8> = (0..0x1000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        roundtrip(&data);
    }

    #[test]
    fn literals_decode_backward_after_tail() {
        // Hand-built stream of five literals: output is the raw block
        // followed by the literals in reverse emission order.
        let mut bits = BitWriter::endian(Cursor::new(Vec::<u8>::new()), BigEndian);
        for byte in [0x11u8, 0x22, 0x33, 0x44, 0x55] {
            bits.write_bit(false).unwrap();
            bits.write_unsigned_var(8, u32::from(byte)).unwrap();
        }
        bits.byte_align().unwrap();
        let mut stream = bits.into_writer().into_inner();
        stream.reverse();

        let tail: Vec<u8> = (0..TAIL as u32).map(|i| (i * 7) as u8).collect();
        let mut blob = Vec::new();
        blob.extend_from_slice(CRILAYLA_MAGIC);
        5u32.write_le(&mut blob);
        (stream.len() as u32).write_le(&mut blob);
        blob.extend_from_slice(&stream);
        blob.extend_from_slice(&tail);

        let out = decompress(&blob).unwrap();
        assert_eq!(&out[..TAIL], tail.as_slice());
        assert_eq!(&out[TAIL..], &[0x55, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn long_match_ladder() {
        // One long run exercises the 2/3/5/8-bit ladder and the 0xFF
        // extension loop in both directions.
        let mut data = vec![0u8; TAIL];
        data.extend(std::iter::repeat_n(0xABu8, 0x500));
        data.extend_from_slice(b"terminator");
        roundtrip(&data);
    }

    #[test]
    fn bad_magic_rejected() {
        assert!(matches!(
            decompress(b"NOTLAYLAxxxxxxxxxxxxxxxx"),
            Err(CriError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn truncated_blob_rejected() {
        let data = vec![1u8; 0x200];
        let blob = compress(&data).unwrap();
        assert!(decompress(&blob[..blob.len() - 0x80]).is_err());
    }

    #[test]
    fn short_input_not_compressible() {
        assert!(compress(&[0u8; 0xFF]).is_err());
    }
}
