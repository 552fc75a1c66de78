//! On-disk headers for the sparse pair store (`.fsp`) and the frozen matrix (`.fsm`)
//!
//! Both files open with a 64-byte little-endian header so sections that
//! follow start on a cache-line boundary.
//!
//! # Pair store
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "FSPAIRS1"
//! 0x08     4       u32 LE      Version (1)
//! 0x0C     4       u32 LE      Flags (bit 0 = labels, bit 1 = indexed)
//! 0x10     4       u32 LE      Score precision
//! 0x14     4       [u8; 4]     Reserved
//! 0x18     8       u64 LE      Pair count
//! 0x20     8       u64 LE      Labels section offset
//! 0x28     8       u64 LE      Labels section length
//! 0x30     8       u64 LE      Index section offset (0 if not indexed)
//! 0x38     8       u64 LE      Expected rows (sizing hint)
//! 0x40     10 × N  records     Pairs {a: u32, b: u32, score: u16}
//! ```
//!
//! The index section holds two copies of the pairs, sorted by `(a, b)` and
//! by `(b, a)`, each `10 × N` bytes.
//!
//! # Frozen matrix
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "FSMATRX1"
//! 0x08     4       u32 LE      Version (1)
//! 0x0C     4       u32 LE      Flags (bits 0-1 = fill policy, bit 2 = initialized)
//! 0x10     4       u32 LE      N: matrix order
//! 0x14     4       u32 LE      Score precision
//! 0x18     8       u64 LE      Labels section offset
//! 0x20     8       u64 LE      Labels section length
//! 0x28     8       u64 LE      Row directory offset (N × {offset: u64, len: u32})
//! 0x30     8       u64 LE      End of row data
//! 0x38     8       [u8; 8]     Reserved
//! ```

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;

use crate::similarity::FillPolicy;

/// Magic bytes of a sparse pair store
pub const PAIRS_MAGIC: [u8; 8] = *b"FSPAIRS1";

/// Magic bytes of a frozen dense matrix
pub const MATRIX_MAGIC: [u8; 8] = *b"FSMATRX1";

/// Header size of both formats
pub const HEADER_SIZE: usize = 64;

/// Bytes per pair record: a (4) + b (4) + score (2)
pub const PAIR_RECORD_SIZE: usize = 10;

/// Bytes per row directory entry: offset (8) + compressed length (4)
pub const ROW_ENTRY_SIZE: usize = 12;

pub const FORMAT_VERSION: u32 = 1;

/// Header flags
pub mod flags {
    /// Pair store: labels section present
    pub const HAS_LABELS: u32 = 1 << 0;
    /// Pair store: sorted endpoint indexes present
    pub const INDEXED: u32 = 1 << 1;
    /// Matrix: fill policy occupies the two low bits
    pub const FILL_POLICY_MASK: u32 = 0b11;
    /// Matrix: labels and row directory have been laid out
    pub const INITIALIZED: u32 = 1 << 2;
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected {expected}")]
    InvalidMagic { expected: &'static str },

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small for header: {0} < {HEADER_SIZE}")]
    TruncatedHeader(usize),

    #[error("Section {section} out of bounds: {offset}+{len} > {file_len}")]
    SectionOutOfBounds {
        section: &'static str,
        offset: u64,
        len: u64,
        file_len: u64,
    },

    #[error("Invalid flags: {0:#x}")]
    InvalidFlags(u32),

    #[error("Invalid section {section}: {reason}")]
    InvalidSection {
        section: &'static str,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Which representation a file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StoreKind {
    Pairs,
    Matrix,
}

/// Detect the store representation from the leading bytes of a file
pub fn detect_store_kind(bytes: &[u8]) -> Option<StoreKind> {
    if bytes.len() < 8 {
        return None;
    }
    if bytes[0..8] == PAIRS_MAGIC {
        Some(StoreKind::Pairs)
    } else if bytes[0..8] == MATRIX_MAGIC {
        Some(StoreKind::Matrix)
    } else {
        None
    }
}

#[inline]
pub(crate) fn le_u16(bytes: &[u8], at: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[at..at + 2]);
    u16::from_le_bytes(buf)
}

#[inline]
pub(crate) fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
pub(crate) fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

pub(crate) fn read_exact_at(mut file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

pub(crate) fn write_all_at(file: &mut File, offset: u64, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

/// Read up to `buf.len()` bytes from the start of `file`
pub(crate) fn read_prefix(mut file: &File, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(0))?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn check_preamble(bytes: &[u8], magic: &[u8; 8], expected: &'static str) -> Result<u32, FormatError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FormatError::TruncatedHeader(bytes.len()));
    }
    if &bytes[0..8] != magic {
        return Err(FormatError::InvalidMagic { expected });
    }
    let version = le_u32(bytes, 8);
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Parsed pair store header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairHeader {
    pub flags: u32,
    pub precision: u16,
    pub pair_count: u64,
    pub labels_offset: u64,
    pub labels_len: u64,
    pub index_offset: u64,
    pub expected_rows: u64,
}

impl PairHeader {
    pub fn new(precision: u16, expected_rows: u64) -> Self {
        Self {
            flags: 0,
            precision,
            pair_count: 0,
            labels_offset: 0,
            labels_len: 0,
            index_offset: 0,
            expected_rows,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        check_preamble(bytes, &PAIRS_MAGIC, "FSPAIRS1")?;

        let flags = le_u32(bytes, 12);
        if flags & !(flags::HAS_LABELS | flags::INDEXED) != 0 {
            return Err(FormatError::InvalidFlags(flags));
        }
        let precision = le_u32(bytes, 16);
        if precision == 0 || precision > u16::MAX as u32 {
            return Err(FormatError::InvalidSection {
                section: "header",
                reason: format!("precision {} outside 1..=65535", precision),
            });
        }

        Ok(Self {
            flags,
            precision: precision as u16,
            pair_count: le_u64(bytes, 24),
            labels_offset: le_u64(bytes, 32),
            labels_len: le_u64(bytes, 40),
            index_offset: le_u64(bytes, 48),
            expected_rows: le_u64(bytes, 56),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&PAIRS_MAGIC);
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..20].copy_from_slice(&(self.precision as u32).to_le_bytes());
        // bytes 20..24 are reserved (zero)
        buf[24..32].copy_from_slice(&self.pair_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.labels_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.labels_len.to_le_bytes());
        buf[48..56].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.expected_rows.to_le_bytes());
        buf
    }

    #[inline]
    pub fn has_labels(&self) -> bool {
        self.flags & flags::HAS_LABELS != 0
    }

    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.flags & flags::INDEXED != 0
    }

    /// Byte offset of pair record `row`
    #[inline(always)]
    pub fn record_offset(row: u64) -> u64 {
        (HEADER_SIZE as u64).saturating_add(row.saturating_mul(PAIR_RECORD_SIZE as u64))
    }

    /// End of the pairs section
    pub fn pairs_end(&self) -> u64 {
        Self::record_offset(self.pair_count)
    }

    /// Bytes occupied by one sorted index copy
    pub fn index_section_len(&self) -> u64 {
        self.pair_count.saturating_mul(PAIR_RECORD_SIZE as u64)
    }

    /// Check every section lies inside a file of `file_len` bytes
    pub fn validate(&self, file_len: u64) -> Result<(), FormatError> {
        check_section("pairs", HEADER_SIZE as u64, self.pairs_end() - HEADER_SIZE as u64, file_len)?;
        if self.has_labels() {
            check_section("labels", self.labels_offset, self.labels_len, file_len)?;
        }
        if self.is_indexed() {
            check_section("index", self.index_offset, self.index_section_len().saturating_mul(2), file_len)?;
        }
        Ok(())
    }
}

/// Parsed frozen matrix header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixHeader {
    pub flags: u32,
    pub order: u32,
    pub precision: u16,
    pub labels_offset: u64,
    pub labels_len: u64,
    pub directory_offset: u64,
    pub data_end: u64,
}

impl MatrixHeader {
    pub fn new(precision: u16, policy: FillPolicy) -> Self {
        Self {
            flags: policy.to_bits(),
            order: 0,
            precision,
            labels_offset: 0,
            labels_len: 0,
            directory_offset: 0,
            data_end: HEADER_SIZE as u64,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        check_preamble(bytes, &MATRIX_MAGIC, "FSMATRX1")?;

        let flags = le_u32(bytes, 12);
        if flags & !(flags::FILL_POLICY_MASK | flags::INITIALIZED) != 0
            || FillPolicy::from_bits(flags & flags::FILL_POLICY_MASK).is_none()
        {
            return Err(FormatError::InvalidFlags(flags));
        }
        let precision = le_u32(bytes, 20);
        if precision == 0 || precision > u16::MAX as u32 {
            return Err(FormatError::InvalidSection {
                section: "header",
                reason: format!("precision {} outside 1..=65535", precision),
            });
        }

        Ok(Self {
            flags,
            order: le_u32(bytes, 16),
            precision: precision as u16,
            labels_offset: le_u64(bytes, 24),
            labels_len: le_u64(bytes, 32),
            directory_offset: le_u64(bytes, 40),
            data_end: le_u64(bytes, 48),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MATRIX_MAGIC);
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..20].copy_from_slice(&self.order.to_le_bytes());
        buf[20..24].copy_from_slice(&(self.precision as u32).to_le_bytes());
        buf[24..32].copy_from_slice(&self.labels_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.labels_len.to_le_bytes());
        buf[40..48].copy_from_slice(&self.directory_offset.to_le_bytes());
        buf[48..56].copy_from_slice(&self.data_end.to_le_bytes());
        // bytes 56..64 are reserved (zero)
        buf
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.flags & flags::INITIALIZED != 0
    }

    pub fn fill_policy(&self) -> FillPolicy {
        FillPolicy::from_bits(self.flags & flags::FILL_POLICY_MASK).unwrap_or_default()
    }

    pub fn set_fill_policy(&mut self, policy: FillPolicy) {
        self.flags = (self.flags & !flags::FILL_POLICY_MASK) | policy.to_bits();
    }

    pub fn directory_len(&self) -> u64 {
        self.order as u64 * ROW_ENTRY_SIZE as u64
    }

    /// First byte after the row directory, where row blobs begin
    pub fn metadata_end(&self) -> u64 {
        self.directory_offset.saturating_add(self.directory_len())
    }

    pub fn validate(&self, file_len: u64) -> Result<(), FormatError> {
        if !self.is_initialized() {
            return Ok(());
        }
        check_section("labels", self.labels_offset, self.labels_len, file_len)?;
        check_section("directory", self.directory_offset, self.directory_len(), file_len)?;
        if self.data_end > file_len {
            return Err(FormatError::SectionOutOfBounds {
                section: "rows",
                offset: HEADER_SIZE as u64,
                len: self.data_end,
                file_len,
            });
        }
        Ok(())
    }
}

fn check_section(section: &'static str, offset: u64, len: u64, file_len: u64) -> Result<(), FormatError> {
    match offset.checked_add(len) {
        Some(end) if end <= file_len => Ok(()),
        _ => Err(FormatError::SectionOutOfBounds {
            section,
            offset,
            len,
            file_len,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_header_roundtrip() {
        let header = PairHeader {
            flags: flags::HAS_LABELS | flags::INDEXED,
            precision: 65535,
            pair_count: 1_000,
            labels_offset: 10_064,
            labels_len: 300,
            index_offset: 10_364,
            expected_rows: 2_048,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 64);

        let parsed = PairHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.has_labels());
        assert!(parsed.is_indexed());
        assert_eq!(parsed.pairs_end(), 64 + 10_000);
    }

    #[test]
    fn test_matrix_header_roundtrip() {
        let mut header = MatrixHeader::new(65535, FillPolicy::UpperTriangleOnly);
        header.flags |= flags::INITIALIZED;
        header.order = 4;
        header.labels_offset = 64;
        header.labels_len = 24;
        header.directory_offset = 88;
        header.data_end = 136;

        let parsed = MatrixHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.fill_policy(), FillPolicy::UpperTriangleOnly);
        assert!(parsed.is_initialized());
        assert_eq!(parsed.directory_len(), 48);
    }

    #[test]
    fn test_invalid_magic_and_version() {
        let bytes = PairHeader::new(100, 0).to_bytes();
        assert!(matches!(
            MatrixHeader::from_bytes(&bytes),
            Err(FormatError::InvalidMagic { .. })
        ));

        let mut bytes = MatrixHeader::new(100, FillPolicy::Symmetric).to_bytes();
        bytes[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            MatrixHeader::from_bytes(&bytes),
            Err(FormatError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            PairHeader::from_bytes(b"FSPAIRS1"),
            Err(FormatError::TruncatedHeader(8))
        ));
    }

    #[test]
    fn test_invalid_flags_and_precision() {
        let mut bytes = MatrixHeader::new(100, FillPolicy::Symmetric).to_bytes();
        bytes[12..16].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(MatrixHeader::from_bytes(&bytes), Err(FormatError::InvalidFlags(3))));

        let mut bytes = PairHeader::new(100, 0).to_bytes();
        bytes[16..20].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            PairHeader::from_bytes(&bytes),
            Err(FormatError::InvalidSection { .. })
        ));
    }

    #[test]
    fn test_validate_sections() {
        let mut header = PairHeader::new(100, 0);
        header.pair_count = 3;
        assert!(header.validate(64 + 30).is_ok());
        assert!(matches!(
            header.validate(64 + 29),
            Err(FormatError::SectionOutOfBounds { section: "pairs", .. })
        ));

        header.flags |= flags::HAS_LABELS;
        header.labels_offset = u64::MAX;
        header.labels_len = 2;
        assert!(header.validate(1 << 20).is_err());
    }

    #[test]
    fn test_detect_store_kind() {
        assert_eq!(detect_store_kind(b"FSPAIRS1"), Some(StoreKind::Pairs));
        assert_eq!(detect_store_kind(b"FSMATRX1..."), Some(StoreKind::Matrix));
        assert_eq!(detect_store_kind(b"INVALID!"), None);
        assert_eq!(detect_store_kind(b"SHORT"), None);
    }
}
