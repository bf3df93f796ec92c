//! The KAR (`NCBI.sra`) container format.

pub mod constants;
pub mod header;
pub mod listing;
pub mod reader;
pub mod toc;
pub mod writer;

pub use header::{ByteOrder, SraHeader};
pub use reader::KarReader;
pub use writer::KarWriter;
