//! Readers, writers and transforms for the CRIWARE container family.
//!
//! ## Formats
//!
//! - **@UTF**: the typed tabular metadata format everything else is
//!   assembled from ([`structs::utf`]).
//! - **AFS2/AWB**: offset-indexed audio banks ([`structs::awb`]).
//! - **ADX**: ADPCM audio headers, loop blocks and footers
//!   ([`structs::adx`]).
//! - **HCA**: chained-subchunk audio headers and the frame ciphers
//!   ([`structs::hca`]).
//! - **CRILAYLA**: the per-file LZ compression used inside CPK
//!   ([`process::crilayla`]).
//! - **CPK**: archives whose directory is a set of @UTF tables
//!   ([`process::cpk`]).
//! - **ACB**: cue banks, @UTF tables nested in @UTF tables over an AWB
//!   ([`process::acb`]).
//! - **USM**: the SofDec2 packet-interleaved stream container
//!   ([`process::usm`]).
//!
//! The sample-level ADX/HCA DSP and WAV I/O are deliberately outside
//! this crate; what lives here is the exact wire understanding: byte
//! layouts, obfuscation masks, alignment and framing rules.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cricodec::process::cpk::Cpk;
//!
//! let data = std::fs::read("archive.cpk")?;
//! let cpk = Cpk::parse(&data)?;
//! for entry in cpk.entries()? {
//!     println!("{} ({} bytes)", entry.path(), entry.extract_size);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Parsers consume byte slices and own their derived buffers; builders
//! validate every precondition before emitting a single byte. Errors
//! follow one taxonomy ([`utils::errors::CriError`]) across the crate.

/// Multi-step drivers: compression, archives, cue banks, streams.
pub mod process;

/// Wire-format structures, one module per format.
pub mod structs;

/// Byte I/O, CRC and error infrastructure.
pub mod utils;
