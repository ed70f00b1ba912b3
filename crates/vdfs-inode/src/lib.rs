#![forbid(unsafe_code)]
//! Inode management.
//!
//! Read and write inode records, map logical block numbers through the
//! 12 direct and three indirect pointer slots, and move file content in and
//! out of 64-byte blocks. Also hosts the UGO permission check.

use vdfs_alloc::Allocator;
use vdfs_block::ByteDevice;
use vdfs_error::{Result, VdfsError};
use vdfs_ondisk::{FileBlock, Inode, OnDiskRecord, PointerBlock, read_record, write_record};
use vdfs_types::{
    BLOCK_SIZE, BlockIndex, ByteOffset, DIRECT_BLOCKS, DOUBLE_INDIRECT_SLOT, INODE_BLOCK_SLOTS,
    InodeIndex, NULL_POINTER, POINTERS_PER_BLOCK, PermClass, Permissions, SINGLE_INDIRECT_SLOT,
    TRIPLE_INDIRECT_SLOT,
};

/// Data blocks reachable from one inode.
pub const MAX_FILE_BLOCKS: usize = DIRECT_BLOCKS
    + POINTERS_PER_BLOCK
    + POINTERS_PER_BLOCK * POINTERS_PER_BLOCK
    + POINTERS_PER_BLOCK * POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;

/// Largest file the pointer layout can describe.
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

// ── Record I/O ──────────────────────────────────────────────────────────────

fn inode_offset<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, ino: InodeIndex) -> Result<ByteOffset> {
    alloc
        .superblock()?
        .inode_offset(ino)
        .ok_or_else(|| VdfsError::Corruption {
            offset: alloc.superblock_offset().0,
            detail: format!("inode {ino} beyond inode table"),
        })
}

fn block_offset<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, block: BlockIndex) -> Result<ByteOffset> {
    alloc
        .superblock()?
        .block_offset(block)
        .ok_or_else(|| VdfsError::Corruption {
            offset: alloc.superblock_offset().0,
            detail: format!("block {block} beyond block table"),
        })
}

pub fn read_inode<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, ino: InodeIndex) -> Result<Inode> {
    read_record(alloc.device(), inode_offset(alloc, ino)?)
}

pub fn write_inode<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    ino: InodeIndex,
    inode: &Inode,
) -> Result<()> {
    write_record(alloc.device(), inode_offset(alloc, ino)?, inode)
}

/// Decode any block-sized record.
pub fn read_block<R: OnDiskRecord, D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    block: BlockIndex,
) -> Result<R> {
    read_record(alloc.device(), block_offset(alloc, block)?)
}

pub fn write_block<R: OnDiskRecord, D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    block: BlockIndex,
    record: &R,
) -> Result<()> {
    write_record(alloc.device(), block_offset(alloc, block)?, record)
}

// ── Logical block mapping ───────────────────────────────────────────────────

/// Where logical block `n` lives: the inode slot holding the root pointer and
/// the index to follow in each pointer block below it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockPath {
    slot: usize,
    indices: Vec<usize>,
}

fn block_path(logical: usize) -> Result<BlockPath> {
    const P: usize = POINTERS_PER_BLOCK;
    if logical < DIRECT_BLOCKS {
        return Ok(BlockPath {
            slot: logical,
            indices: Vec::new(),
        });
    }
    let rel = logical - DIRECT_BLOCKS;
    if rel < P {
        return Ok(BlockPath {
            slot: SINGLE_INDIRECT_SLOT,
            indices: vec![rel],
        });
    }
    let rel = rel - P;
    if rel < P * P {
        return Ok(BlockPath {
            slot: DOUBLE_INDIRECT_SLOT,
            indices: vec![rel / P, rel % P],
        });
    }
    let rel = rel - P * P;
    if rel < P * P * P {
        return Ok(BlockPath {
            slot: TRIPLE_INDIRECT_SLOT,
            indices: vec![rel / (P * P), (rel / P) % P, rel % P],
        });
    }
    Err(VdfsError::NoSpace)
}

/// Physical block holding logical block `logical`, if mapped.
pub fn map_block<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    inode: &Inode,
    logical: usize,
) -> Result<Option<BlockIndex>> {
    let path = block_path(logical)?;
    let mut current = BlockIndex::from_raw(inode.block[path.slot]);
    for idx in path.indices {
        let Some(ptr) = current else {
            return Ok(None);
        };
        let table: PointerBlock = read_block(alloc, ptr)?;
        current = BlockIndex::from_raw(table.pointers[idx]);
    }
    Ok(current)
}

/// Allocate a data block at `logical`, creating missing pointer blocks.
///
/// The caller must write `inode` back afterwards; the root pointer may have
/// changed. Everything allocated stays reachable from `inode`, so
/// [`release_blocks`] undoes a partial failure.
pub fn allocate_block<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    inode: &mut Inode,
    logical: usize,
) -> Result<BlockIndex> {
    let path = block_path(logical)?;
    if path.indices.is_empty() {
        if let Some(existing) = BlockIndex::from_raw(inode.block[path.slot]) {
            return Ok(existing);
        }
        let block = alloc.find_free_block()?;
        inode.block[path.slot] = block.to_raw().map_err(|e| parse_err(&e))?;
        return Ok(block);
    }

    let mut table_block = match BlockIndex::from_raw(inode.block[path.slot]) {
        Some(block) => block,
        None => {
            let block = alloc.find_free_block()?;
            write_block(alloc, block, &PointerBlock::empty())?;
            inode.block[path.slot] = block.to_raw().map_err(|e| parse_err(&e))?;
            tracing::debug!(slot = path.slot, %block, "allocated indirect root");
            block
        }
    };

    let last = path.indices.len() - 1;
    for (depth, idx) in path.indices.iter().copied().enumerate() {
        let mut table: PointerBlock = read_block(alloc, table_block)?;
        if let Some(next) = BlockIndex::from_raw(table.pointers[idx]) {
            if depth == last {
                return Ok(next);
            }
            table_block = next;
            continue;
        }
        let fresh = alloc.find_free_block()?;
        if depth != last {
            write_block(alloc, fresh, &PointerBlock::empty())?;
        }
        table.pointers[idx] = fresh.to_raw().map_err(|e| parse_err(&e))?;
        write_block(alloc, table_block, &table)?;
        if depth == last {
            return Ok(fresh);
        }
        table_block = fresh;
    }
    Err(VdfsError::Corruption {
        offset: 0,
        detail: format!("unreachable block path for logical block {logical}"),
    })
}

fn parse_err(err: &vdfs_types::ParseError) -> VdfsError {
    VdfsError::Parse(err.to_string())
}

/// Every block reachable from an inode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSet {
    /// Data blocks in logical order.
    pub data: Vec<BlockIndex>,
    /// Pointer blocks, parents before children.
    pub pointers: Vec<BlockIndex>,
}

fn collect_tree<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    table_block: BlockIndex,
    depth: usize,
    set: &mut BlockSet,
) -> Result<()> {
    set.pointers.push(table_block);
    let table: PointerBlock = read_block(alloc, table_block)?;
    for raw in table.pointers {
        let Some(child) = BlockIndex::from_raw(raw) else {
            continue;
        };
        if depth == 1 {
            set.data.push(child);
        } else {
            collect_tree(alloc, child, depth - 1, set)?;
        }
    }
    Ok(())
}

pub fn collect_blocks<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, inode: &Inode) -> Result<BlockSet> {
    let mut set = BlockSet::default();
    for raw in &inode.block[..DIRECT_BLOCKS] {
        if let Some(block) = BlockIndex::from_raw(*raw) {
            set.data.push(block);
        }
    }
    for (slot, depth) in [
        (SINGLE_INDIRECT_SLOT, 1),
        (DOUBLE_INDIRECT_SLOT, 2),
        (TRIPLE_INDIRECT_SLOT, 3),
    ] {
        if let Some(root) = BlockIndex::from_raw(inode.block[slot]) {
            collect_tree(alloc, root, depth, &mut set)?;
        }
    }
    Ok(set)
}

/// Data blocks in logical order.
pub fn data_blocks<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, inode: &Inode) -> Result<Vec<BlockIndex>> {
    collect_blocks(alloc, inode).map(|set| set.data)
}

/// Free every data and pointer block and reset the pointers and size.
pub fn release_blocks<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, inode: &mut Inode) -> Result<()> {
    let set = collect_blocks(alloc, inode)?;
    for block in set.data.iter().chain(set.pointers.iter()) {
        alloc.free_block(*block)?;
    }
    inode.block = [NULL_POINTER; INODE_BLOCK_SLOTS];
    inode.size = 0;
    tracing::debug!(
        data = set.data.len(),
        pointers = set.pointers.len(),
        "released inode blocks"
    );
    Ok(())
}

// ── File content ────────────────────────────────────────────────────────────

/// File content, cut to the recorded size.
pub fn read_data<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, inode: &Inode) -> Result<Vec<u8>> {
    let blocks = data_blocks(alloc, inode)?;
    let mut out = Vec::with_capacity(blocks.len() * BLOCK_SIZE);
    for block in blocks {
        let chunk: FileBlock = read_block(alloc, block)?;
        out.extend_from_slice(&chunk.data);
    }
    let size = usize::try_from(inode.size).unwrap_or(0);
    out.truncate(size);
    Ok(out)
}

/// Replace the content of `inode` with `data`.
///
/// The new content goes into freshly allocated blocks first; the old blocks
/// are freed only once every new block is written. On failure the new
/// blocks are freed again and `inode` is untouched, so the old content
/// stays intact. The caller writes `inode` back on success.
pub fn write_data<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    inode: &mut Inode,
    data: &[u8],
    now: f32,
) -> Result<()> {
    if data.len() > MAX_FILE_SIZE {
        return Err(VdfsError::NoSpace);
    }
    let size = i32::try_from(data.len()).map_err(|_| VdfsError::NoSpace)?;
    let mut staged = inode.clone();
    staged.block = [NULL_POINTER; INODE_BLOCK_SLOTS];
    staged.size = 0;
    let result = data
        .chunks(BLOCK_SIZE)
        .enumerate()
        .try_for_each(|(logical, chunk)| {
            let block = allocate_block(alloc, &mut staged, logical)?;
            let record = FileBlock::from_chunk(chunk).map_err(|e| parse_err(&e))?;
            write_block(alloc, block, &record)
        });
    if let Err(err) = result {
        tracing::debug!(error = %err, len = data.len(), "content write failed, rolling back");
        release_blocks(alloc, &mut staged)?;
        return Err(err);
    }
    release_blocks(alloc, inode)?;
    inode.block = staged.block;
    inode.size = size;
    inode.mtime = now;
    Ok(())
}

// ── Permissions ─────────────────────────────────────────────────────────────

/// Identity used for permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: i32,
    pub gid: i32,
    /// `root` bypasses every check.
    pub root: bool,
}

impl Credentials {
    pub const ROOT: Self = Self {
        uid: 1,
        gid: 1,
        root: true,
    };

    #[must_use]
    pub fn class_for(&self, inode: &Inode) -> PermClass {
        if inode.uid == self.uid {
            PermClass::Owner
        } else if inode.gid == self.gid {
            PermClass::Group
        } else {
            PermClass::Other
        }
    }

    /// Whether these credentials hold every bit of `mask` on `inode`.
    #[must_use]
    pub fn can(&self, inode: &Inode, mask: u8) -> bool {
        self.root || inode.perm.allows(self.class_for(inode), mask)
    }

    #[must_use]
    pub fn owns(&self, inode: &Inode) -> bool {
        self.root || inode.uid == self.uid
    }
}

/// Build a fresh inode owned by `creds`.
#[must_use]
pub fn new_inode(kind: vdfs_types::NodeKind, perm: Permissions, creds: &Credentials, now: f32) -> Inode {
    Inode::new(kind, perm, creds.uid, creds.gid, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdfs_alloc::{FsLayout, initialize};
    use vdfs_block::MemoryByteDevice;
    use vdfs_types::{FsType, NodeKind, PERM_READ, PERM_WRITE};

    fn device(inodes: u64) -> (MemoryByteDevice, ByteOffset) {
        let size = 76 + inodes * 284;
        let dev = MemoryByteDevice::new(size as usize);
        let layout = FsLayout::compute(0, size, FsType::Ext2, 0).expect("layout");
        initialize(&dev, &layout, size, 0.0).expect("init");
        (dev, ByteOffset(0))
    }

    fn file_inode() -> Inode {
        Inode::new(NodeKind::File, Permissions::parse("664").unwrap(), 1, 1, 0.0)
    }

    #[test]
    fn block_paths_cover_every_level() {
        assert_eq!(block_path(0).unwrap().slot, 0);
        assert_eq!(block_path(11).unwrap().slot, 11);
        assert_eq!(block_path(12).unwrap(), BlockPath { slot: 12, indices: vec![0] });
        assert_eq!(block_path(27).unwrap(), BlockPath { slot: 12, indices: vec![15] });
        assert_eq!(block_path(28).unwrap(), BlockPath { slot: 13, indices: vec![0, 0] });
        assert_eq!(block_path(28 + 17).unwrap(), BlockPath { slot: 13, indices: vec![1, 1] });
        let first_triple = 28 + 256;
        assert_eq!(
            block_path(first_triple).unwrap(),
            BlockPath { slot: 14, indices: vec![0, 0, 0] }
        );
        assert_eq!(
            block_path(MAX_FILE_BLOCKS - 1).unwrap(),
            BlockPath { slot: 14, indices: vec![15, 15, 15] }
        );
        assert!(matches!(block_path(MAX_FILE_BLOCKS), Err(VdfsError::NoSpace)));
    }

    #[test]
    fn small_content_uses_direct_blocks() {
        let (dev, sb) = device(10);
        let alloc = Allocator::new(&dev, sb);
        let mut inode = file_inode();
        write_data(&alloc, &mut inode, b"hello\tworld\n", 1.0).expect("write");
        assert_eq!(inode.size, 12);
        assert!(inode.block[0] >= 0);
        assert_eq!(inode.block[1], NULL_POINTER);
        assert_eq!(read_data(&alloc, &inode).expect("read"), b"hello\tworld\n");
    }

    #[test]
    fn content_spanning_single_and_double_indirect() {
        let (dev, sb) = device(40);
        let alloc = Allocator::new(&dev, sb);
        let mut inode = file_inode();
        // 30 data blocks: 12 direct, 16 single, 2 double.
        let data: Vec<u8> = (0..30 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        write_data(&alloc, &mut inode, &data, 1.0).expect("write");
        assert!(inode.block[SINGLE_INDIRECT_SLOT] >= 0);
        assert!(inode.block[DOUBLE_INDIRECT_SLOT] >= 0);
        assert_eq!(inode.block[TRIPLE_INDIRECT_SLOT], NULL_POINTER);
        assert_eq!(read_data(&alloc, &inode).expect("read"), data);

        let set = collect_blocks(&alloc, &inode).expect("collect");
        assert_eq!(set.data.len(), 30);
        // single table, double root, one double leaf table
        assert_eq!(set.pointers.len(), 3);
        let used = alloc.superblock().unwrap().blocks_count;
        assert_eq!(used, 33);
    }

    #[test]
    fn rewrite_frees_pointer_blocks() {
        let (dev, sb) = device(40);
        let alloc = Allocator::new(&dev, sb);
        let mut inode = file_inode();
        write_data(&alloc, &mut inode, &[7_u8; 20 * BLOCK_SIZE], 1.0).expect("write");
        write_data(&alloc, &mut inode, b"short", 2.0).expect("rewrite");
        let sb = alloc.superblock().unwrap();
        assert_eq!(sb.blocks_count, 1, "only one data block remains");
        assert_eq!(inode.block[SINGLE_INDIRECT_SLOT], NULL_POINTER);
        assert_eq!(read_data(&alloc, &inode).expect("read"), b"short");
    }

    #[test]
    fn failed_write_rolls_back_allocations() {
        let (dev, sb) = device(2);
        let alloc = Allocator::new(&dev, sb);
        let mut inode = file_inode();
        // 6 block slots cannot hold 7 data blocks.
        let err = write_data(&alloc, &mut inode, &[1_u8; 7 * BLOCK_SIZE], 1.0).unwrap_err();
        assert!(matches!(err, VdfsError::NoSpace));
        let sb = alloc.superblock().unwrap();
        assert_eq!(sb.blocks_count, 0);
        assert_eq!(sb.free_blocks_count, 6);
        assert_eq!(inode.block, [NULL_POINTER; 15]);
    }

    #[test]
    fn failed_rewrite_keeps_old_content_allocated() {
        let (dev, sb) = device(2);
        let alloc = Allocator::new(&dev, sb);
        let mut inode = file_inode();
        write_data(&alloc, &mut inode, b"original", 1.0).expect("write");
        let before = inode.clone();

        // Five free blocks cannot hold six new ones.
        let err = write_data(&alloc, &mut inode, &[2_u8; 6 * BLOCK_SIZE], 2.0).unwrap_err();
        assert!(matches!(err, VdfsError::NoSpace));
        assert_eq!(inode, before, "inode is untouched by a failed rewrite");
        assert_eq!(read_data(&alloc, &inode).expect("read"), b"original");

        let old_block = BlockIndex::from_raw(inode.block[0]).expect("mapped");
        assert!(
            alloc.is_used(vdfs_alloc::BitmapKind::Block, old_block.0).expect("bitmap"),
            "old block must stay allocated"
        );
        let sb = alloc.superblock().unwrap();
        assert_eq!(sb.blocks_count, 1);
        assert_eq!(sb.free_blocks_count, 5);
    }

    #[test]
    fn map_block_follows_pointers() {
        let (dev, sb) = device(20);
        let alloc = Allocator::new(&dev, sb);
        let mut inode = file_inode();
        let block = allocate_block(&alloc, &mut inode, 13).expect("alloc");
        assert_eq!(map_block(&alloc, &inode, 13).expect("map"), Some(block));
        assert_eq!(map_block(&alloc, &inode, 12).expect("map"), None);
        assert_eq!(map_block(&alloc, &inode, 40).expect("map"), None);
        assert_eq!(
            allocate_block(&alloc, &mut inode, 13).expect("again"),
            block,
            "allocating a mapped block returns it"
        );
    }

    #[test]
    fn inode_record_roundtrip_through_table() {
        let (dev, sb) = device(4);
        let alloc = Allocator::new(&dev, sb);
        let inode = file_inode();
        write_inode(&alloc, InodeIndex(3), &inode).expect("write");
        assert_eq!(read_inode(&alloc, InodeIndex(3)).expect("read"), inode);
        assert!(read_inode(&alloc, InodeIndex(4)).is_err());
    }

    #[test]
    fn permission_classes() {
        let mut inode = file_inode();
        inode.perm = Permissions::parse("640").unwrap();
        inode.uid = 5;
        inode.gid = 2;
        let owner = Credentials { uid: 5, gid: 9, root: false };
        let member = Credentials { uid: 6, gid: 2, root: false };
        let other = Credentials { uid: 7, gid: 3, root: false };
        assert!(owner.can(&inode, PERM_READ | PERM_WRITE));
        assert!(member.can(&inode, PERM_READ));
        assert!(!member.can(&inode, PERM_WRITE));
        assert!(!other.can(&inode, PERM_READ));
        assert!(Credentials::ROOT.can(&inode, PERM_WRITE));
        assert!(owner.owns(&inode));
        assert!(!member.owns(&inode));
    }
}
