//! Error taxonomy shared by every parser and builder.
//!
//! Parsers fail fast at the first inconsistency and report the absolute
//! byte offset of the violation. Builders validate all preconditions
//! before a single output byte is produced, so a failed build emits
//! nothing.

/// Errors produced by the container parsers, builders and ciphers.
#[derive(thiserror::Error, Debug)]
pub enum CriError {
    /// The leading bytes of a chunk do not match the expected magic.
    #[error("invalid magic: expected {expected:02X?}, found {actual:02X?}")]
    InvalidMagic {
        expected: &'static [u8],
        actual: Vec<u8>,
    },

    /// Structurally valid input that this build does not implement.
    #[error("unsupported format: {what}")]
    UnsupportedFormat { what: String },

    /// A length, offset or index is inconsistent with the container.
    #[error("invalid data: {what} at offset {offset:#X}")]
    InvalidData { what: String, offset: usize },

    /// A cipher transform was requested on data already in that state.
    #[error("cipher refused: {reason}")]
    CipherRefused { reason: String },

    /// Underlying read/write failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CriError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::UnsupportedFormat { what: what.into() }
    }

    pub fn invalid(what: impl Into<String>, offset: usize) -> Self {
        Self::InvalidData {
            what: what.into(),
            offset,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self::CipherRefused {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CriError>;
