//! Error types for Mach-O loading and indexing.
//!
//! Only a small subset of these ever escapes [`MachOFile::open`](crate::MachOFile::open):
//! failing to open or map the file, and asking a fat binary for an architecture it
//! does not contain. Everything else is a decoding error that the index builders log
//! and recover from.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for Mach-O introspection.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Container Errors ====================
    #[error("architecture \"{arch}\" not found in \"{path}\"")]
    ArchitectureNotFound { arch: String, path: PathBuf },

    #[error("unknown architecture name: {0}")]
    UnknownArchitecture(String),

    #[error("load command at offset {offset:#x} extends beyond the command area")]
    LoadCommandOverflow { offset: usize },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("unexpected end of data at offset {offset:#x}")]
    UnexpectedEof { offset: usize },

    #[error("invalid LEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    #[error("invalid export trie at offset {offset:#x}: {reason}")]
    InvalidExportTrie { offset: usize, reason: &'static str },
}

/// A specialized Result type for Mach-O operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error comes from decoding image content.
    ///
    /// Index builders log these and keep whatever they decoded before the
    /// failure instead of aborting the load.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Parse { .. }
                | Error::BufferTooSmall { .. }
                | Error::UnexpectedEof { .. }
                | Error::InvalidUleb128 { .. }
                | Error::InvalidExportTrie { .. }
                | Error::LoadCommandOverflow { .. }
        )
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_not_found_message() {
        let err = Error::ArchitectureNotFound {
            arch: "armv7".into(),
            path: PathBuf::from("/tmp/app"),
        };
        assert_eq!(
            err.to_string(),
            "architecture \"armv7\" not found in \"/tmp/app\""
        );
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_decode_errors_are_recoverable() {
        assert!(Error::UnexpectedEof { offset: 4 }.is_recoverable());
        assert!(Error::parse(0x20, "bad section").is_recoverable());
        assert!(Error::buffer_too_small(8, 2).is_recoverable());
    }
}
