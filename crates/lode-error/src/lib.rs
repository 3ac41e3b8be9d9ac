#![forbid(unsafe_code)]
//! Error types for LodeFS.
//!
//! Defines `Error` and a `Result<T>` alias used throughout the workspace.

use lode_types::ParseError;
use thiserror::Error;

/// Unified error type for all LodeFS operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no valid superblock found (bad magic on every copy)")]
    BadMagic,

    #[error("{kind} checksum mismatch at {addr:#x}")]
    BadChecksum { kind: &'static str, addr: u64 },

    #[error("logical range {logical:#x}+{len:#x} is not mapped by any chunk")]
    Unmapped { logical: u64, len: u64 },

    #[error("tree {0} has no ROOT_ITEM in the root tree")]
    NoTree(u64),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("invalid on-disk format: {0}")]
    Format(#[from] ParseError),
}

impl Error {
    /// Whether this error is an ordinary miss rather than a volume defect.
    ///
    /// `NotFound` is a normal answer to a lookup; everything else indicates
    /// I/O trouble or corrupt metadata.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `Error`.
pub type Result<T> = std::result::Result<T, Error>;
