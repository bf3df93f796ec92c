pub const MAGIC_NCBI: [u8; 4] = *b"NCBI";
pub const MAGIC_SRA: [u8; 4] = *b".sra";

/// Byte-order tag as written by the producer.
pub const BYTE_ORDER_TAG: u32 = 0x0503_1988;
/// The same tag read back with the opposite endianness.
pub const BYTE_ORDER_REVERSE: u32 = 0x8819_0305;

pub const CURRENT_VERSION: u32 = 1;

/// Magic, byte-order tag and version.
pub const HEADER_PREFIX_SIZE: usize = 16;
/// Version-1 header: prefix plus the 64-bit data-section offset.
pub const HEADER_SIZE: usize = 24;

pub const ALIGNMENT: u64 = 4;

/// Payload copy chunk during create and extract.
pub const COPY_CHUNK: usize = 1024 * 1024;

pub const MAX_NAME_LEN: usize = u16::MAX as usize;

/// Round `offset` up to the next multiple of `ALIGNMENT`.
pub const fn align(offset: u64) -> u64 {
    (offset + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// TOC record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    Directory = 1,
    File = 2,
    ChunkedFile = 3,
    SoftLink = 4,
    HardLink = 5,
    EmptyFile = 6,
    ZombieFile = 7,
    Unknown = 255,
}

impl From<u8> for TypeCode {
    fn from(v: u8) -> Self {
        match v {
            1 => TypeCode::Directory,
            2 => TypeCode::File,
            3 => TypeCode::ChunkedFile,
            4 => TypeCode::SoftLink,
            5 => TypeCode::HardLink,
            6 => TypeCode::EmptyFile,
            7 => TypeCode::ZombieFile,
            _ => TypeCode::Unknown,
        }
    }
}

impl From<TypeCode> for u8 {
    fn from(val: TypeCode) -> Self {
        val as u8
    }
}
