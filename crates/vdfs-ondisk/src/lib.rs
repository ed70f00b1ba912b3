#![forbid(unsafe_code)]
//! Bit-exact on-disk records for VDFS images.
//!
//! The codec modules are pure: they turn byte slices into typed records and
//! back. [`read_record`] and [`write_record`] are the only entry points that
//! touch a `ByteDevice`, and they attach the absolute offset to any decode
//! failure.

pub mod disk;
pub mod fs;
pub mod journal;

pub use disk::{Ebr, Mbr, Partition};
pub use fs::{FileBlock, FolderBlock, FolderEntry, Inode, PointerBlock, SuperBlock};
pub use journal::JournalEntry;

use vdfs_block::ByteDevice;
use vdfs_error::{Result, VdfsError};
use vdfs_types::{ByteOffset, ParseError};

/// A fixed-size little-endian record.
pub trait OnDiskRecord: Sized {
    const SIZE: usize;

    fn parse_from_bytes(bytes: &[u8]) -> std::result::Result<Self, ParseError>;

    /// Encode into `buf[..Self::SIZE]`.
    fn encode_into(&self, buf: &mut [u8]) -> std::result::Result<(), ParseError>;

    fn to_bytes(&self) -> std::result::Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; Self::SIZE];
        self.encode_into(&mut buf)?;
        Ok(buf)
    }
}

/// Map a codec error to the runtime error, tagging it with the record's
/// absolute offset.
#[must_use]
pub fn parse_to_vdfs_error(err: &ParseError, offset: ByteOffset) -> VdfsError {
    match err {
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            VdfsError::Corruption {
                offset: offset.0,
                detail: err.to_string(),
            }
        }
        ParseError::InvalidMagic { .. } | ParseError::InvalidField { .. } => {
            VdfsError::Format(format!("{err} at offset {offset}"))
        }
    }
}

/// Decode the record stored at `offset`.
pub fn read_record<R: OnDiskRecord, D: ByteDevice + ?Sized>(dev: &D, offset: ByteOffset) -> Result<R> {
    let bytes = dev.read_vec(offset.0, R::SIZE)?;
    R::parse_from_bytes(&bytes).map_err(|err| parse_to_vdfs_error(&err, offset))
}

/// Encode `record` and write it at `offset`.
pub fn write_record<R: OnDiskRecord, D: ByteDevice + ?Sized>(
    dev: &D,
    offset: ByteOffset,
    record: &R,
) -> Result<()> {
    let bytes = record
        .to_bytes()
        .map_err(|err| parse_to_vdfs_error(&err, offset))?;
    dev.write_all_at(offset.0, &bytes)
}

// ── Encoding helpers shared by the codec modules ────────────────────────────

pub(crate) fn ensure_len(buf: &[u8], needed: usize) -> std::result::Result<(), ParseError> {
    if buf.len() < needed {
        return Err(ParseError::InsufficientData {
            needed,
            offset: 0,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[inline]
pub(crate) fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}
