use std::io::{self, Read, Write};

use crate::error::{IoContext, KarError, Result};
use crate::formats::kar::constants::*;

/// Endianness of every multi-byte field in an archive, as announced by the
/// header's byte-order tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn u16(self, b: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(b),
            ByteOrder::Big => u16::from_be_bytes(b),
        }
    }

    pub fn u32(self, b: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        }
    }

    pub fn u64(self, b: [u8; 8]) -> u64 {
        match self {
            ByteOrder::Little => u64::from_le_bytes(b),
            ByteOrder::Big => u64::from_be_bytes(b),
        }
    }

    pub fn i64(self, b: [u8; 8]) -> i64 {
        self.u64(b) as i64
    }
}

/// Fixed archive header (version 1).
///
/// ```text
/// 0   "NCBI"
/// 4   ".sra"
/// 8   byte-order tag   u32
/// 12  version          u32
/// 16  file_offset      u64   start of the data section
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SraHeader {
    pub byte_order: ByteOrder,
    pub version: u32,
    pub file_offset: u64,
}

impl SraHeader {
    /// Header for a new archive whose data section starts at `file_offset`.
    pub fn new(file_offset: u64) -> Self {
        Self {
            byte_order: ByteOrder::Little,
            version: CURRENT_VERSION,
            file_offset,
        }
    }

    /// Read and verify a header. Consumes at most `HEADER_SIZE` bytes.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        let n = read_up_to(reader, &mut buf).io_msg("Failed to read archive header")?;
        Self::parse(&buf[..n])
    }

    /// Verify a header held in `buf`, which may be shorter than a full header.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // 1. Prefix present
        if buf.len() < HEADER_PREFIX_SIZE {
            return Err(KarError::HeaderTruncated(buf.len()));
        }

        // 2. Magic
        if buf[0..4] != MAGIC_NCBI || buf[4..8] != MAGIC_SRA {
            let mut magic = [0u8; 8];
            magic.copy_from_slice(&buf[0..8]);
            return Err(KarError::BadMagic(magic));
        }

        // 3. Byte order
        let tag = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let byte_order = match tag {
            BYTE_ORDER_TAG => ByteOrder::Little,
            BYTE_ORDER_REVERSE => ByteOrder::Big,
            other => return Err(KarError::BadByteOrder(other)),
        };

        // 4. Version
        let version = byte_order.u32([buf[12], buf[13], buf[14], buf[15]]);
        match version {
            0 => return Err(KarError::InvalidVersion),
            CURRENT_VERSION => {}
            v => return Err(KarError::UnsupportedVersion(v)),
        }

        // 5. Version 1 trailer
        if buf.len() < HEADER_SIZE {
            return Err(KarError::HeaderTruncated(buf.len()));
        }
        let mut off = [0u8; 8];
        off.copy_from_slice(&buf[16..24]);
        let file_offset = byte_order.u64(off);
        if file_offset < HEADER_SIZE as u64 {
            return Err(KarError::TocCorrupt(format!(
                "data section offset {} lies inside the header",
                file_offset
            )));
        }

        Ok(Self {
            byte_order,
            version,
            file_offset,
        })
    }

    /// Write the header little-endian.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC_NCBI);
        buf[4..8].copy_from_slice(&MAGIC_SRA);
        buf[8..12].copy_from_slice(&BYTE_ORDER_TAG.to_le_bytes());
        buf[12..16].copy_from_slice(&self.version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.file_offset.to_le_bytes());
        buf
    }

    /// Bytes between the end of the header and the data section.
    pub fn toc_size(&self) -> u64 {
        self.file_offset - HEADER_SIZE as u64
    }
}

/// `read` until `buf` is full or the reader is exhausted.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
