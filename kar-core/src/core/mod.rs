//! Format-independent building blocks: the entry tree, alias resolution,
//! filesystem scanning and the md5 sidecar.

pub mod alias;
pub mod cancel;
pub mod entry;
pub mod md5;
pub mod native;
pub mod progress;
pub mod scan;

// Re-exports
pub use alias::{resolve, resolve_all};
pub use entry::{Entry, EntryHeader, EntryId, EntryKind, EntryTree, Resolution, ResolvedKind};
