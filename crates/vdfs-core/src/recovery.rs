//! Journal listing, simulated loss and journal replay.

use serde::Serialize;
use vdfs_block::ByteDevice;
use vdfs_error::{Result, VdfsError};
use vdfs_inode::Credentials;
use vdfs_journal::{Journal, JournalOp};
use vdfs_ondisk::JournalEntry;
use vdfs_types::USERS_FILE_PATH;

use crate::volume::Volume;

/// Outcome of a journal replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub replayed: usize,
    pub skipped: usize,
    pub failed: usize,
}

fn require_journal<'v, 'a, D: ByteDevice + ?Sized>(vol: &'v Volume<'a, D>) -> Result<&'v Journal<'a, D>> {
    vol.journal()
        .ok_or_else(|| VdfsError::InvalidArgument("filesystem has no journal (use 3fs)".to_owned()))
}

/// Non-empty journal entries in slot order.
pub fn journaling<D: ByteDevice + ?Sized>(vol: &Volume<'_, D>) -> Result<Vec<JournalEntry>> {
    require_journal(vol)?.entries()
}

/// Zero both bitmaps, the inode table and the block table. The superblock
/// geometry and the journal are kept.
pub fn loss<D: ByteDevice + ?Sized>(vol: &Volume<'_, D>) -> Result<()> {
    require_journal(vol)?;
    let sb = vol.alloc.wipe_tables()?;
    tracing::info!(
        free_inodes = sb.free_inodes_count,
        free_blocks = sb.free_blocks_count,
        "filesystem tables wiped"
    );
    Ok(())
}

/// Rebuild the tree from the journal.
///
/// Only `mkdir` and `mkfile` entries are re-executed, as root and without
/// journaling. `/users.txt` is reset to `users_content`.
///
/// A file is rebuilt from its journal payload, which holds the content as
/// lossy UTF-8 cut to the first 64 bytes. Longer or non-UTF-8 content comes
/// back in that reduced form, and later `edit` entries are not applied.
pub fn recover<D: ByteDevice + ?Sized>(vol: &Volume<'_, D>, users_content: &str) -> Result<RecoveryReport> {
    let entries = journaling(vol)?;
    vol.alloc.wipe_tables()?;
    vol.seed(users_content)?;

    let mut replay = Volume::open(vol.alloc.device(), vol.alloc.superblock_offset(), Credentials::ROOT)?;
    replay.record = false;
    replay.file_perm = vol.file_perm;
    replay.dir_perm = vol.dir_perm;

    let mut report = RecoveryReport::default();
    for entry in &entries {
        let op = match entry.op.parse::<JournalOp>() {
            Ok(op) => op,
            Err(_) => {
                tracing::warn!(slot = entry.count, op = %entry.op, "unrecognized journal entry");
                report.skipped += 1;
                continue;
            }
        };
        let outcome = match op {
            JournalOp::Mkdir if entry.path == "/" => None,
            JournalOp::Mkfile if entry.path == USERS_FILE_PATH => None,
            JournalOp::Mkdir => Some(match replay.mkdir(&entry.path, true) {
                Err(VdfsError::Exists(_)) => Ok(()),
                other => other.map(|_| ()),
            }),
            JournalOp::Mkfile => Some(replay.put_file(&entry.path, entry.payload.as_bytes()).map(|_| ())),
            _ => None,
        };
        match outcome {
            None => {
                tracing::trace!(slot = entry.count, %op, path = %entry.path, "journal entry not replayed");
                report.skipped += 1;
            }
            Some(Ok(())) => report.replayed += 1,
            Some(Err(err)) => {
                tracing::warn!(slot = entry.count, %op, path = %entry.path, error = %err, "replay failed");
                report.failed += 1;
            }
        }
    }
    tracing::info!(
        replayed = report.replayed,
        skipped = report.skipped,
        failed = report.failed,
        "recovery finished"
    );
    Ok(report)
}
