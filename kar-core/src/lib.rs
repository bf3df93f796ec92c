//! KAR archive engine
//!
//! Packs a directory tree (files, subdirectories and symbolic links) into a
//! single seekable `.sra`-style archive and lists, verifies or unpacks it
//! again. The on-disk layout is a fixed header, a packed table of contents
//! and 4-byte aligned file payloads sorted by size.

pub mod core;
pub mod error;
pub mod formats;

pub use crate::core::cancel::CancelFlag;
pub use crate::core::entry::{EntryId, EntryTree};
pub use crate::core::progress::ProgressFn;
pub use error::{ErrorClass, KarError, Result};
pub use formats::kar::reader::{extract, list, open_and_verify, ExtractOptions, ExtractSummary, KarReader, ListOptions};
pub use formats::kar::writer::{create, CreateOptions, CreateSummary, KarWriter};
