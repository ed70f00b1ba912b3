#![forbid(unsafe_code)]
//! Superblock geometry, bitmaps and inode/block allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on packed, LSB-first bitmaps.
//! 2. **FsLayout**: region placement computed once at format time.
//! 3. **Allocator**: first-free allocation against one partition. It keeps
//!    no state between calls; every operation re-reads the superblock and
//!    writes it back after changing a counter.

use serde::Serialize;
use vdfs_block::ByteDevice;
use vdfs_error::{Result, VdfsError};
use vdfs_ondisk::{SuperBlock, read_record, write_record};
use vdfs_types::{
    BLOCK_SIZE, BYTES_PER_INODE_SLOT, BlockIndex, ByteOffset, FsType, INODE_SIZE, InodeIndex,
    JOURNAL_ENTRY_SIZE, SUPERBLOCK_SIZE, VDFS_MAGIC,
};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    (0..count).filter(|&idx| !bitmap_get(bitmap, idx)).count() as u32
}

/// First free (zero) bit in the first `count` bits, scanning from 0.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    (0..count).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Render the first `count` bits as `0`/`1`, `per_line` characters per line.
#[must_use]
pub fn bitmap_render(bitmap: &[u8], count: u32, per_line: usize) -> String {
    let mut out = String::with_capacity(count as usize + count as usize / per_line.max(1) + 1);
    for idx in 0..count {
        out.push(if bitmap_get(bitmap, idx) { '1' } else { '0' });
        if per_line > 0 && (idx as usize + 1) % per_line == 0 {
            out.push('\n');
        }
    }
    if !out.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Characters per line in bitmap reports.
pub const BITMAP_DUMP_WIDTH: usize = 20;

// ── Filesystem layout ───────────────────────────────────────────────────────

/// Region placement for one formatted partition. All offsets are absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsLayout {
    pub fs_type: FsType,
    /// Inode slots (`n`). There are `3n` block slots.
    pub inodes: u32,
    pub superblock_start: u64,
    pub journal_start: Option<u64>,
    pub journal_entries: u32,
    pub bm_inode_start: u64,
    pub bm_block_start: u64,
    pub inode_start: u64,
    pub block_start: u64,
    pub end: u64,
}

impl FsLayout {
    /// Compute the layout of a partition of `size` bytes at `start`.
    ///
    /// `n = floor((size - sizeof(SuperBlock) - J) / (4 + sizeof(Inode) +
    /// 3 * sizeof(Block)))` where `J` is the journal table size for
    /// journaled filesystems and zero otherwise.
    pub fn compute(start: u64, size: u64, fs_type: FsType, journal_entries: u32) -> Result<Self> {
        let journal_entries = if fs_type.has_journal() {
            journal_entries
        } else {
            0
        };
        let journal_bytes = u64::from(journal_entries) * JOURNAL_ENTRY_SIZE as u64;
        let overhead = SUPERBLOCK_SIZE as u64 + journal_bytes;
        let usable = size.checked_sub(overhead).ok_or(VdfsError::NoSpace)?;
        let n = usable / BYTES_PER_INODE_SLOT as u64;
        if n < 2 {
            return Err(VdfsError::NoSpace);
        }
        let inodes = u32::try_from(n)
            .map_err(|_| VdfsError::InvalidArgument(format!("partition too large: {size}")))?;

        let journal_start = start + SUPERBLOCK_SIZE as u64;
        let bm_inode_start = journal_start + journal_bytes;
        let bm_block_start = bm_inode_start + n;
        let inode_start = bm_block_start + 3 * n;
        let block_start = inode_start + n * INODE_SIZE as u64;
        let end = block_start + 3 * n * BLOCK_SIZE as u64;
        Ok(Self {
            fs_type,
            inodes,
            superblock_start: start,
            journal_start: fs_type.has_journal().then_some(journal_start),
            journal_entries,
            bm_inode_start,
            bm_block_start,
            inode_start,
            block_start,
            end,
        })
    }

    #[must_use]
    pub fn blocks(&self) -> u32 {
        self.inodes.saturating_mul(3)
    }

    /// Fresh superblock with every slot free.
    pub fn superblock(&self, now: f64) -> Result<SuperBlock> {
        let field = |value: u64, name: &str| {
            i32::try_from(value)
                .map_err(|_| VdfsError::InvalidArgument(format!("{name} offset exceeds i32")))
        };
        Ok(SuperBlock {
            fs_type: self.fs_type.code(),
            inodes_count: 0,
            blocks_count: 0,
            free_blocks_count: field(u64::from(self.blocks()), "block count")?,
            free_inodes_count: field(u64::from(self.inodes), "inode count")?,
            mtime: now,
            umtime: 0.0,
            mnt_count: 0,
            magic: VDFS_MAGIC,
            inode_size: INODE_SIZE as i32,
            block_size: BLOCK_SIZE as i32,
            first_ino: field(self.inode_start, "inode table")?,
            first_blo: field(self.block_start, "block table")?,
            bm_inode_start: field(self.bm_inode_start, "inode bitmap")?,
            bm_block_start: field(self.bm_block_start, "block bitmap")?,
            inode_start: field(self.inode_start, "inode table")?,
            block_start: field(self.block_start, "block table")?,
        })
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BitmapKind {
    Inode,
    Block,
}

/// First-free allocator for one partition.
#[derive(Debug)]
pub struct Allocator<'a, D: ByteDevice + ?Sized> {
    dev: &'a D,
    sb_offset: ByteOffset,
}

fn offset_of(value: i32, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| VdfsError::Corruption {
        offset: 0,
        detail: format!("negative {what} offset {value}"),
    })
}

impl<'a, D: ByteDevice + ?Sized> Allocator<'a, D> {
    #[must_use]
    pub fn new(dev: &'a D, sb_offset: ByteOffset) -> Self {
        Self { dev, sb_offset }
    }

    #[must_use]
    pub fn device(&self) -> &'a D {
        self.dev
    }

    #[must_use]
    pub fn superblock_offset(&self) -> ByteOffset {
        self.sb_offset
    }

    pub fn superblock(&self) -> Result<SuperBlock> {
        read_record(self.dev, self.sb_offset)
    }

    pub fn write_superblock(&self, sb: &SuperBlock) -> Result<()> {
        write_record(self.dev, self.sb_offset, sb)
    }

    fn region(sb: &SuperBlock, kind: BitmapKind) -> Result<(u64, u32)> {
        match kind {
            BitmapKind::Inode => Ok((
                offset_of(sb.bm_inode_start, "inode bitmap")?,
                sb.inode_capacity(),
            )),
            BitmapKind::Block => Ok((
                offset_of(sb.bm_block_start, "block bitmap")?,
                sb.block_capacity(),
            )),
        }
    }

    /// Read the packed bitmap region of `kind`.
    pub fn read_bitmap(&self, sb: &SuperBlock, kind: BitmapKind) -> Result<(Vec<u8>, u32)> {
        let (start, count) = Self::region(sb, kind)?;
        let bytes = self.dev.read_vec(start, count.div_ceil(8) as usize)?;
        Ok((bytes, count))
    }

    /// Flip one bit, touching only the byte that holds it.
    fn write_bit(&self, sb: &SuperBlock, kind: BitmapKind, idx: u32, used: bool) -> Result<()> {
        let (start, _) = Self::region(sb, kind)?;
        let at = start + u64::from(idx / 8);
        let mut byte = [0_u8; 1];
        self.dev.read_exact_at(at, &mut byte)?;
        if used {
            bitmap_set(&mut byte, idx % 8);
        } else {
            bitmap_clear(&mut byte, idx % 8);
        }
        self.dev.write_all_at(at, &byte)
    }

    pub fn is_used(&self, kind: BitmapKind, idx: u32) -> Result<bool> {
        let sb = self.superblock()?;
        let (bitmap, count) = self.read_bitmap(&sb, kind)?;
        Ok(idx < count && bitmap_get(&bitmap, idx))
    }

    /// Indexes of every used slot of `kind`, ascending.
    pub fn used_slots(&self, kind: BitmapKind) -> Result<Vec<u32>> {
        let sb = self.superblock()?;
        let (bitmap, count) = self.read_bitmap(&sb, kind)?;
        Ok((0..count).filter(|&idx| bitmap_get(&bitmap, idx)).collect())
    }

    fn refresh_first_free(&self, sb: &mut SuperBlock, kind: BitmapKind) -> Result<()> {
        let (bitmap, count) = self.read_bitmap(sb, kind)?;
        let first = bitmap_find_free(&bitmap, count);
        let (base, size, slot) = match kind {
            BitmapKind::Inode => (sb.inode_start, INODE_SIZE as i64, &mut sb.first_ino),
            BitmapKind::Block => (sb.block_start, BLOCK_SIZE as i64, &mut sb.first_blo),
        };
        *slot = match first {
            Some(idx) => i32::try_from(i64::from(base) + i64::from(idx) * size).unwrap_or(-1),
            None => -1,
        };
        Ok(())
    }

    fn allocate(&self, kind: BitmapKind) -> Result<u32> {
        let mut sb = self.superblock()?;
        let (bitmap, count) = self.read_bitmap(&sb, kind)?;
        let Some(idx) = bitmap_find_free(&bitmap, count) else {
            tracing::debug!(?kind, "bitmap exhausted");
            return Err(VdfsError::NoSpace);
        };
        self.write_bit(&sb, kind, idx, true)?;
        match kind {
            BitmapKind::Inode => {
                sb.inodes_count += 1;
                sb.free_inodes_count = (sb.free_inodes_count - 1).max(0);
            }
            BitmapKind::Block => {
                sb.blocks_count += 1;
                sb.free_blocks_count = (sb.free_blocks_count - 1).max(0);
            }
        }
        self.refresh_first_free(&mut sb, kind)?;
        self.write_superblock(&sb)?;
        tracing::debug!(?kind, idx, "allocated slot");
        Ok(idx)
    }

    fn release(&self, kind: BitmapKind, idx: u32) -> Result<()> {
        let mut sb = self.superblock()?;
        let (bitmap, count) = self.read_bitmap(&sb, kind)?;
        if idx >= count {
            return Err(VdfsError::Corruption {
                offset: self.sb_offset.0,
                detail: format!("{kind:?} index {idx} beyond capacity {count}"),
            });
        }
        if !bitmap_get(&bitmap, idx) {
            return Ok(());
        }
        let (record_offset, record_len) = match kind {
            BitmapKind::Inode => (sb.inode_offset(InodeIndex(idx)), INODE_SIZE),
            BitmapKind::Block => (sb.block_offset(BlockIndex(idx)), BLOCK_SIZE),
        };
        let record_offset = record_offset.ok_or_else(|| VdfsError::Corruption {
            offset: self.sb_offset.0,
            detail: format!("{kind:?} record {idx} out of range"),
        })?;
        self.dev.zero_range(record_offset.0, record_len as u64)?;
        self.write_bit(&sb, kind, idx, false)?;
        let capacity = i32::try_from(count).unwrap_or(i32::MAX);
        match kind {
            BitmapKind::Inode => {
                sb.inodes_count = (sb.inodes_count - 1).max(0);
                sb.free_inodes_count = (sb.free_inodes_count + 1).min(capacity);
            }
            BitmapKind::Block => {
                sb.blocks_count = (sb.blocks_count - 1).max(0);
                sb.free_blocks_count = (sb.free_blocks_count + 1).min(capacity);
            }
        }
        self.refresh_first_free(&mut sb, kind)?;
        self.write_superblock(&sb)?;
        tracing::debug!(?kind, idx, "freed slot");
        Ok(())
    }

    /// Claim the lowest free inode slot.
    pub fn find_free_inode(&self) -> Result<InodeIndex> {
        self.allocate(BitmapKind::Inode).map(InodeIndex)
    }

    /// Claim the lowest free block slot.
    pub fn find_free_block(&self) -> Result<BlockIndex> {
        self.allocate(BitmapKind::Block).map(BlockIndex)
    }

    /// Zero the inode record and release its slot. Freeing a free slot is a
    /// no-op.
    pub fn free_inode(&self, inode: InodeIndex) -> Result<()> {
        self.release(BitmapKind::Inode, inode.0)
    }

    pub fn free_block(&self, block: BlockIndex) -> Result<()> {
        self.release(BitmapKind::Block, block.0)
    }

    /// Zero both bitmaps and both tables and reset the counters, leaving the
    /// superblock geometry and anything before the inode bitmap untouched.
    pub fn wipe_tables(&self) -> Result<SuperBlock> {
        let mut sb = self.superblock()?;
        let start = offset_of(sb.bm_inode_start, "inode bitmap")?;
        let end = offset_of(sb.block_start, "block table")?
            + u64::from(sb.block_capacity()) * BLOCK_SIZE as u64;
        self.dev.zero_range(start, end - start)?;
        sb.inodes_count = 0;
        sb.blocks_count = 0;
        sb.free_inodes_count = i32::try_from(sb.inode_capacity()).unwrap_or(i32::MAX);
        sb.free_blocks_count = i32::try_from(sb.block_capacity()).unwrap_or(i32::MAX);
        sb.first_ino = sb.inode_start;
        sb.first_blo = sb.block_start;
        self.write_superblock(&sb)?;
        tracing::debug!(start, len = end - start, "wiped bitmaps and tables");
        Ok(sb)
    }

    /// Bitmap of `kind` rendered for reports.
    pub fn bitmap_dump(&self, kind: BitmapKind) -> Result<String> {
        let sb = self.superblock()?;
        let (bitmap, count) = self.read_bitmap(&sb, kind)?;
        Ok(bitmap_render(&bitmap, count, BITMAP_DUMP_WIDTH))
    }
}

/// Zero the partition, then write a fresh superblock for `layout`.
pub fn initialize<D: ByteDevice + ?Sized>(
    dev: &D,
    layout: &FsLayout,
    partition_len: u64,
    now: f64,
) -> Result<SuperBlock> {
    dev.zero_range(layout.superblock_start, partition_len)?;
    let sb = layout.superblock(now)?;
    write_record(dev, ByteOffset(layout.superblock_start), &sb)?;
    tracing::debug!(
        inodes = layout.inodes,
        blocks = layout.blocks(),
        fs_type = ?layout.fs_type,
        "initialized superblock"
    );
    Ok(sb)
}

// ── Tests ───────────────────────────────────────────────────────────────────
