#![forbid(unsafe_code)]
//! Shared newtypes, layout constants and byte helpers for VDFS.
//!
//! Everything here is pure: no I/O and no engine state. The codecs in
//! `vdfs-ondisk` and the allocators build on these helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Record sizes ────────────────────────────────────────────────────────────

pub const MBR_SIZE: usize = 153;
pub const PARTITION_SIZE: usize = 35;
pub const EBR_SIZE: usize = 30;
pub const SUPERBLOCK_SIZE: usize = 76;
pub const INODE_SIZE: usize = 88;
pub const BLOCK_SIZE: usize = 64;
pub const JOURNAL_ENTRY_SIZE: usize = 114;

/// Superblock magic number shared with ext2/ext3.
pub const VDFS_MAGIC: i32 = 0xEF53;

/// Number of partition-table slots in the MBR.
pub const PARTITION_SLOTS: usize = 4;
pub const PARTITION_NAME_LEN: usize = 16;
pub const PARTITION_ID_LEN: usize = 4;

/// Inode block pointer layout: 12 direct, then single, double and triple
/// indirect.
pub const INODE_BLOCK_SLOTS: usize = 15;
pub const DIRECT_BLOCKS: usize = 12;
pub const SINGLE_INDIRECT_SLOT: usize = 12;
pub const DOUBLE_INDIRECT_SLOT: usize = 13;
pub const TRIPLE_INDIRECT_SLOT: usize = 14;
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / 4;

pub const FOLDER_ENTRIES: usize = 4;
pub const FOLDER_NAME_LEN: usize = 12;

pub const JOURNAL_OP_LEN: usize = 10;
pub const JOURNAL_PATH_LEN: usize = 32;
pub const JOURNAL_PAYLOAD_LEN: usize = 64;

/// Bytes consumed per inode when sizing a filesystem: one bitmap byte for
/// the inode, three for its blocks, the inode record and three blocks.
pub const BYTES_PER_INODE_SLOT: usize = 4 + INODE_SIZE + 3 * BLOCK_SIZE;

pub const USERS_FILE_NAME: &str = "users.txt";
pub const USERS_FILE_PATH: &str = "/users.txt";
pub const ROOT_USER: &str = "root";
pub const ROOT_GROUP: &str = "root";

/// Raw pointer value for an unused block slot or free directory entry.
pub const NULL_POINTER: i32 = -1;

// ── Index newtypes ──────────────────────────────────────────────────────────

/// Index into the inode table of one filesystem (0 is the root).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeIndex(pub u32);

impl InodeIndex {
    pub const ROOT: Self = Self(0);
    pub const USERS: Self = Self(1);

    /// Interpret an on-disk pointer. Negative values mean "none".
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    /// On-disk pointer value.
    pub fn to_raw(self) -> Result<i32, ParseError> {
        i32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "inode_index",
        })
    }
}

/// Index into the block table of one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    pub fn to_raw(self) -> Result<i32, ParseError> {
        i32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_index",
        })
    }
}

/// Byte offset inside a disk image (pread/pwrite semantics).
///
/// Keeps absolute offsets from being mixed up with slot indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Offset of an on-disk `i32` start field. Negative starts are rejected.
    pub fn from_start(start: i32) -> Result<Self, ParseError> {
        u64::try_from(start)
            .map(Self)
            .map_err(|_| ParseError::IntegerConversion { field: "start" })
    }

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    /// Offset of record `index` in a table of `record_size`-byte records
    /// starting here.
    #[must_use]
    pub fn record(self, index: u32, record_size: usize) -> Option<Self> {
        let stride = u64::try_from(record_size).ok()?;
        u64::from(index)
            .checked_mul(stride)
            .and_then(|delta| self.checked_add(delta))
    }
}

impl fmt::Display for InodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enumerations stored as single bytes ─────────────────────────────────────

/// Placement policy for new partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fit {
    Best,
    First,
    Worst,
}

impl Fit {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Best => b'B',
            Self::First => b'F',
            Self::Worst => b'W',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ParseError> {
        match byte.to_ascii_uppercase() {
            b'B' => Ok(Self::Best),
            b'F' => Ok(Self::First),
            b'W' => Ok(Self::Worst),
            _ => Err(ParseError::InvalidField {
                field: "fit",
                reason: "expected B, F or W",
            }),
        }
    }

    /// Parse the command spelling `BF`, `FF` or `WF` (case-insensitive).
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match text.to_ascii_uppercase().as_str() {
            "BF" => Ok(Self::Best),
            "FF" => Ok(Self::First),
            "WF" => Ok(Self::Worst),
            _ => Err(ParseError::InvalidField {
                field: "fit",
                reason: "expected BF, FF or WF",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionKind {
    Primary,
    Extended,
    Logical,
}

impl PartitionKind {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Primary => b'P',
            Self::Extended => b'E',
            Self::Logical => b'L',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ParseError> {
        match byte.to_ascii_uppercase() {
            b'P' => Ok(Self::Primary),
            b'E' => Ok(Self::Extended),
            b'L' => Ok(Self::Logical),
            _ => Err(ParseError::InvalidField {
                field: "partition_kind",
                reason: "expected P, E or L",
            }),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match text.as_bytes() {
            [byte] => Self::from_byte(*byte),
            _ => Err(ParseError::InvalidField {
                field: "partition_kind",
                reason: "expected P, E or L",
            }),
        }
    }
}

/// Size unit for `mkdisk`/`fdisk` sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeUnit {
    Bytes,
    Kilo,
    Mega,
}

impl SizeUnit {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match text.to_ascii_uppercase().as_str() {
            "B" => Ok(Self::Bytes),
            "K" => Ok(Self::Kilo),
            "M" => Ok(Self::Mega),
            _ => Err(ParseError::InvalidField {
                field: "unit",
                reason: "expected B, K or M",
            }),
        }
    }

    #[must_use]
    pub fn multiplier(self) -> i64 {
        match self {
            Self::Bytes => 1,
            Self::Kilo => 1024,
            Self::Mega => 1024 * 1024,
        }
    }

    /// Convert `amount` of this unit to bytes, failing on overflow of the
    /// on-disk `i32` size fields.
    pub fn to_bytes(self, amount: i64) -> Result<i32, ParseError> {
        amount
            .checked_mul(self.multiplier())
            .and_then(|bytes| i32::try_from(bytes).ok())
            .ok_or(ParseError::IntegerConversion { field: "size" })
    }
}

/// Filesystem flavour recorded in `SuperBlock.fs_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsType {
    Ext2,
    Ext3,
}

impl FsType {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Ext2 => 2,
            Self::Ext3 => 3,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, ParseError> {
        match code {
            2 => Ok(Self::Ext2),
            3 => Ok(Self::Ext3),
            _ => Err(ParseError::InvalidField {
                field: "fs_type",
                reason: "expected 2 or 3",
            }),
        }
    }

    /// Parse the command spelling `2fs` or `3fs`.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match text.to_ascii_lowercase().as_str() {
            "2fs" => Ok(Self::Ext2),
            "3fs" => Ok(Self::Ext3),
            _ => Err(ParseError::InvalidField {
                field: "fs",
                reason: "expected 2fs or 3fs",
            }),
        }
    }

    #[must_use]
    pub fn has_journal(self) -> bool {
        matches!(self, Self::Ext3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Directory,
    File,
}

impl NodeKind {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Directory => b'0',
            Self::File => b'1',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ParseError> {
        match byte {
            b'0' => Ok(Self::Directory),
            b'1' => Ok(Self::File),
            _ => Err(ParseError::InvalidField {
                field: "inode_type",
                reason: "expected '0' or '1'",
            }),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory => f.write_str("dir"),
            Self::File => f.write_str("file"),
        }
    }
}

// ── Permissions ─────────────────────────────────────────────────────────────

pub const PERM_READ: u8 = 4;
pub const PERM_WRITE: u8 = 2;
pub const PERM_EXEC: u8 = 1;

/// Which digit of a UGO triple applies to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermClass {
    Owner,
    Group,
    Other,
}

/// Three ASCII octal digits, owner/group/other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions([u8; 3]);

impl Permissions {
    pub const FULL: Self = Self(*b"777");
    /// Mode given to newly created files and directories.
    pub const DEFAULT: Self = Self(*b"664");

    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let bytes: [u8; 3] = text
            .as_bytes()
            .try_into()
            .map_err(|_| ParseError::InvalidField {
                field: "perm",
                reason: "expected three digits",
            })?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Result<Self, ParseError> {
        if bytes.iter().all(|b| (b'0'..=b'7').contains(b)) {
            Ok(Self(bytes))
        } else {
            Err(ParseError::InvalidField {
                field: "perm",
                reason: "digits must be 0..=7",
            })
        }
    }

    #[must_use]
    pub fn as_bytes(self) -> [u8; 3] {
        self.0
    }

    #[must_use]
    pub fn digit(self, class: PermClass) -> u8 {
        let idx = match class {
            PermClass::Owner => 0,
            PermClass::Group => 1,
            PermClass::Other => 2,
        };
        self.0[idx] - b'0'
    }

    /// Whether `class` holds every bit in `mask` (`PERM_READ` etc.).
    #[must_use]
    pub fn allows(self, class: PermClass, mask: u8) -> bool {
        self.digit(class) & mask == mask
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

// ── Parse errors and byte helpers ───────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    read_fixed::<4>(data, offset).map(i32::from_le_bytes)
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    read_fixed::<4>(data, offset).map(u32::from_le_bytes)
}

#[inline]
pub fn read_le_f32(data: &[u8], offset: usize) -> Result<f32, ParseError> {
    read_fixed::<4>(data, offset).map(f32::from_le_bytes)
}

#[inline]
pub fn read_le_f64(data: &[u8], offset: usize) -> Result<f64, ParseError> {
    read_fixed::<8>(data, offset).map(f64::from_le_bytes)
}

/// Decode a NUL-padded name field, trimming trailing padding and spaces.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Encode `text` into a NUL-padded fixed field. Fails if it does not fit.
pub fn nul_padded<const N: usize>(text: &str, field: &'static str) -> Result<[u8; N], ParseError> {
    let bytes = text.as_bytes();
    if bytes.len() > N {
        return Err(ParseError::InvalidField {
            field,
            reason: "too long",
        });
    }
    let mut out = [0_u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a
/// UTF-8 sequence.
#[must_use]
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Seconds since the unix epoch as stored in `f32`/`f64` time fields.
#[must_use]
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
