//! Error types for image construction and inspection
//!
//! Every failure is detected before any byte of output is produced, so a
//! caller either gets a complete image or one of these.

use thiserror::Error;

/// Errors raised while building or reading a PE image
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeError {
    #[error("invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: &'static str },

    #[error("name {name:?} is {len} bytes long, limit is {max}")]
    NameTooLong { name: String, len: usize, max: usize },

    #[error("section {second} overlaps {first}")]
    SectionOverlap { first: String, second: String },

    #[error("{what} {value:#x} is not a multiple of {alignment:#x}")]
    AlignmentViolation {
        what: &'static str,
        value: u64,
        alignment: u64,
    },

    #[error("section {name} ({size:#x} bytes) overflows the 32-bit image address space")]
    OversizedSection { name: String, size: u64 },

    #[error("invalid entry point: {0}")]
    InvalidEntryPoint(String),

    #[error("data directory index {index} is out of range ({count} entries)")]
    InvalidDataDirectory { index: usize, count: usize },

    #[error("malformed import table: {0}")]
    MalformedImportTable(String),

    #[error("truncated image: needed {needed} bytes at offset {offset:#x}")]
    Truncated { offset: usize, needed: usize },

    #[error("bad {0} signature")]
    BadSignature(&'static str),
}

/// Result type for image operations
pub type Result<T> = std::result::Result<T, PeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = PeError::AlignmentViolation {
            what: "virtual address",
            value: 0x1234,
            alignment: 0x1000,
        };
        assert_eq!(
            e.to_string(),
            "virtual address 0x1234 is not a multiple of 0x1000"
        );

        let e = PeError::SectionOverlap {
            first: ".text".to_string(),
            second: ".idata".to_string(),
        };
        assert_eq!(e.to_string(), "section .idata overlaps .text");
    }
}
