#![forbid(unsafe_code)]
//! Operation journal for ext3-style partitions.
//!
//! A fixed table of 114-byte slots sits between the superblock and the inode
//! bitmap. Appends go to the first empty slot; a full table overwrites slot 0
//! and logs a warning. There is no persisted cursor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vdfs_block::ByteDevice;
use vdfs_error::{Result, VdfsError};
use vdfs_ondisk::{JournalEntry, OnDiskRecord, SuperBlock, read_record, write_record};
use vdfs_types::{
    ByteOffset, FsType, JOURNAL_ENTRY_SIZE, JOURNAL_OP_LEN, JOURNAL_PATH_LEN, JOURNAL_PAYLOAD_LEN,
    truncate_utf8,
};

/// Journaled operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalOp {
    Mkdir,
    Mkfile,
    Remove,
    Edit,
    Rename,
    Move,
    Copy,
    Chmod,
    Chown,
    Mkgrp,
    Rmgrp,
    Mkusr,
    Rmusr,
    Chgrp,
}

impl JournalOp {
    pub const ALL: [Self; 14] = [
        Self::Mkdir,
        Self::Mkfile,
        Self::Remove,
        Self::Edit,
        Self::Rename,
        Self::Move,
        Self::Copy,
        Self::Chmod,
        Self::Chown,
        Self::Mkgrp,
        Self::Rmgrp,
        Self::Mkusr,
        Self::Rmusr,
        Self::Chgrp,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mkdir => "mkdir",
            Self::Mkfile => "mkfile",
            Self::Remove => "remove",
            Self::Edit => "edit",
            Self::Rename => "rename",
            Self::Move => "move",
            Self::Copy => "copy",
            Self::Chmod => "chmod",
            Self::Chown => "chown",
            Self::Mkgrp => "mkgrp",
            Self::Rmgrp => "rmgrp",
            Self::Mkusr => "mkusr",
            Self::Rmusr => "rmusr",
            Self::Chgrp => "chgrp",
        }
    }

    /// Whether recovery re-executes this operation.
    #[must_use]
    pub fn is_replayable(self) -> bool {
        matches!(self, Self::Mkdir | Self::Mkfile)
    }
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalOp {
    type Err = VdfsError;

    fn from_str(text: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == text)
            .ok_or_else(|| VdfsError::InvalidArgument(format!("unknown journal op {text:?}")))
    }
}

/// Journal table of one partition.
#[derive(Debug)]
pub struct Journal<'a, D: ByteDevice + ?Sized> {
    dev: &'a D,
    start: ByteOffset,
    slots: u32,
}

impl<'a, D: ByteDevice + ?Sized> Journal<'a, D> {
    /// Locate the table of a formatted partition. Non-journaled filesystems
    /// fail `InvalidArgument`.
    pub fn locate(dev: &'a D, sb: &SuperBlock, slots: u32) -> Result<Self> {
        let fs_type = sb
            .fs_type()
            .map_err(|e| VdfsError::Format(e.to_string()))?;
        if fs_type != FsType::Ext3 {
            return Err(VdfsError::InvalidArgument(
                "journal requires a 3fs filesystem".to_owned(),
            ));
        }
        let start = sb.journal_start(slots).ok_or_else(|| VdfsError::Corruption {
            offset: 0,
            detail: format!("journal of {slots} slots does not fit before the inode bitmap"),
        })?;
        Ok(Self { dev, start, slots })
    }

    #[must_use]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    fn slot_offset(&self, slot: u32) -> Result<ByteOffset> {
        self.start
            .record(slot, JOURNAL_ENTRY_SIZE)
            .ok_or_else(|| VdfsError::Format(format!("journal slot {slot} overflows")))
    }

    /// Every slot, empty or not, in slot order.
    pub fn read_slots(&self) -> Result<Vec<JournalEntry>> {
        (0..self.slots)
            .map(|slot| read_record(self.dev, self.slot_offset(slot)?))
            .collect()
    }

    /// Non-empty entries in slot order.
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        Ok(self
            .read_slots()?
            .into_iter()
            .filter(|entry| !entry.is_empty())
            .collect())
    }

    /// Record one operation. Returns the slot written.
    pub fn append(&self, op: JournalOp, path: &str, payload: &str, date: u32) -> Result<u32> {
        let slot = match self
            .read_slots()?
            .iter()
            .position(JournalEntry::is_empty)
        {
            Some(free) => u32::try_from(free).unwrap_or(0),
            None => {
                tracing::warn!(slots = self.slots, %op, path, "journal full, overwriting slot 0");
                0
            }
        };
        let entry = JournalEntry {
            count: i32::try_from(slot).unwrap_or(0),
            op: truncate_utf8(op.as_str(), JOURNAL_OP_LEN).to_owned(),
            path: truncate_utf8(path, JOURNAL_PATH_LEN).to_owned(),
            payload: truncate_utf8(payload, JOURNAL_PAYLOAD_LEN).to_owned(),
            date,
        };
        write_record(self.dev, self.slot_offset(slot)?, &entry)?;
        tracing::debug!(slot, %op, path, "journal entry appended");
        Ok(slot)
    }

    /// Zero the whole table.
    pub fn clear(&self) -> Result<()> {
        self.dev.zero_range(
            self.start.0,
            u64::from(self.slots) * JournalEntry::SIZE as u64,
        )
    }
}
