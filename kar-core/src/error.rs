//! Error taxonomy for the archive engine

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KarError>;

/// Coarse classification used by callers to decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Corrupt or unsupported archive contents. Never retried.
    Format,
    /// The tree cannot be represented in the on-disk format.
    Encoding,
    /// Filesystem or archive I/O failed.
    Io,
    /// Two siblings share a name.
    DuplicateName,
    /// The operation was interrupted through a `CancelFlag`.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum KarError {
    #[error("corrupt archive file - header too short ({0} bytes)")]
    HeaderTruncated(usize),

    #[error("invalid file format - bad magic {0:02x?}")]
    BadMagic([u8; 8]),

    #[error("invalid byte order tag {0:#010x}")]
    BadByteOrder(u32),

    #[error("invalid archive version 0")]
    InvalidVersion,

    #[error("archive version {0} not supported")]
    UnsupportedVersion(u32),

    #[error("toc truncated: needed {needed} bytes at offset {offset}, region holds {available}")]
    TocTruncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("toc corrupt: {0}")]
    TocCorrupt(String),

    #[error("name of entry '{name}' is {len} bytes, longer than 65535")]
    NameTooLong { name: String, len: usize },

    #[error("link target of alias '{name}' is {len} bytes, longer than 65535")]
    LinkTooLong { name: String, len: usize },

    #[error("directory '{name}' encodes to {size} bytes, more than a toc container can index")]
    DirectoryTooLarge { name: String, size: u64 },

    #[error("toc encoding wrote {actual} bytes but sizing pass computed {expected}")]
    TocSizeMismatch { expected: u64, actual: u64 },

    #[error("entry '{0}' already exists in its directory")]
    DuplicateName(String),

    #[error("entry '{0}' is not a directory")]
    NotADirectory(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("archive ended early while reading '{name}': expected {expected} bytes, got {got}")]
    PayloadTruncated { name: String, expected: u64, got: u64 },

    #[error("source file '{path}' changed size during archiving: expected {expected} bytes, got {got}")]
    SourceChanged { path: PathBuf, expected: u64, got: u64 },

    #[error("'{0}' already exists (use force to overwrite)")]
    AlreadyExists(PathBuf),

    #[error("operation cancelled")]
    Cancelled,
}

impl KarError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KarError::HeaderTruncated(_)
            | KarError::BadMagic(_)
            | KarError::BadByteOrder(_)
            | KarError::InvalidVersion
            | KarError::UnsupportedVersion(_)
            | KarError::TocTruncated { .. }
            | KarError::TocCorrupt(_)
            | KarError::NotADirectory(_) => ErrorClass::Format,
            KarError::NameTooLong { .. }
            | KarError::LinkTooLong { .. }
            | KarError::DirectoryTooLarge { .. }
            | KarError::TocSizeMismatch { .. } => ErrorClass::Encoding,
            KarError::DuplicateName(_) => ErrorClass::DuplicateName,
            KarError::Io { .. }
            | KarError::PayloadTruncated { .. }
            | KarError::SourceChanged { .. }
            | KarError::AlreadyExists(_) => ErrorClass::Io,
            KarError::Cancelled => ErrorClass::Cancelled,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        KarError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attaches the attempted operation and path to a raw `io::Error`.
pub(crate) trait IoContext<T> {
    fn io_context(self, what: &str, path: &Path) -> Result<T>;
    fn io_msg(self, msg: &str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, what: &str, path: &Path) -> Result<T> {
        self.map_err(|e| KarError::io(format!("{} '{}'", what, path.display()), e))
    }

    fn io_msg(self, msg: &str) -> Result<T> {
        self.map_err(|e| KarError::io(msg, e))
    }
}
