#![forbid(unsafe_code)]
//! Directory operations.
//!
//! [`DirectoryBlock`] wraps one 4-entry folder block. The free functions
//! below work on a whole directory inode: they scan every data block in
//! logical order, grow the directory by one block when it is full, and keep
//! `.`/`..` in slots 0 and 1 of the first block.

use serde::Serialize;
use vdfs_alloc::Allocator;
use vdfs_block::ByteDevice;
use vdfs_error::{Result, VdfsError};
use vdfs_inode::{allocate_block, data_blocks, read_block, write_block, write_inode};
use vdfs_ondisk::{FolderBlock, FolderEntry, Inode};
use vdfs_types::{BlockIndex, FOLDER_ENTRIES, FOLDER_NAME_LEN, InodeIndex};

pub const DOT: &str = ".";
pub const DOTDOT: &str = "..";

/// Slots 0 and 1 of a directory's first block hold `.` and `..`.
const RESERVED_SLOTS: usize = 2;

/// Reject names that cannot be stored in a folder entry.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VdfsError::InvalidArgument(
            "entry name cannot be empty".to_owned(),
        ));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(VdfsError::InvalidArgument(format!(
            "entry name {name:?} contains a separator"
        )));
    }
    if name == DOT || name == DOTDOT {
        return Err(VdfsError::InvalidArgument(format!("reserved name {name:?}")));
    }
    if name.len() > FOLDER_NAME_LEN {
        return Err(VdfsError::InvalidArgument(format!(
            "entry name {name:?} exceeds {FOLDER_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

fn is_dot(name: &str) -> bool {
    name == DOT || name == DOTDOT
}

fn raw_inode(ino: InodeIndex) -> Result<i32> {
    ino.to_raw().map_err(|e| VdfsError::Parse(e.to_string()))
}

// ── Single block ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryBlock {
    block: FolderBlock,
    first: bool,
}

impl DirectoryBlock {
    /// First block of a new directory: `.` → `self_ino`, `..` → `parent`.
    pub fn new_first(self_ino: InodeIndex, parent: InodeIndex) -> Result<Self> {
        let mut block = FolderBlock::empty();
        block.entries[0] = FolderEntry {
            name: DOT.to_owned(),
            inode: raw_inode(self_ino)?,
        };
        block.entries[1] = FolderEntry {
            name: DOTDOT.to_owned(),
            inode: raw_inode(parent)?,
        };
        Ok(Self { block, first: true })
    }

    /// Overflow block with four free slots.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            block: FolderBlock::empty(),
            first: false,
        }
    }

    #[must_use]
    pub fn from_folder(block: FolderBlock, first: bool) -> Self {
        Self { block, first }
    }

    #[must_use]
    pub fn as_folder(&self) -> &FolderBlock {
        &self.block
    }

    /// Live entries as `(slot, name, inode)`, including `.` and `..`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, &str, InodeIndex)> {
        self.block
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_free())
            .filter_map(|(slot, entry)| {
                InodeIndex::from_raw(entry.inode).map(|ino| (slot, entry.name.as_str(), ino))
            })
    }

    /// Live entries other than `.` and `..`.
    pub fn children(&self) -> impl Iterator<Item = (usize, &str, InodeIndex)> {
        self.entries().filter(|(_, name, _)| !is_dot(name))
    }

    /// Case-insensitive lookup, skipping `.` and `..`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(usize, InodeIndex)> {
        self.children()
            .find(|(_, entry, _)| entry.eq_ignore_ascii_case(name))
            .map(|(slot, _, ino)| (slot, ino))
    }

    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.free_slot().is_some()
    }

    fn free_slot(&self) -> Option<usize> {
        let start = if self.first { RESERVED_SLOTS } else { 0 };
        (start..FOLDER_ENTRIES).find(|slot| self.block.entries[*slot].is_free())
    }

    /// Store `name → inode` in the first free slot. Returns the slot, or
    /// `None` when the block is full.
    pub fn insert(&mut self, name: &str, inode: InodeIndex) -> Result<Option<usize>> {
        validate_name(name)?;
        let Some(slot) = self.free_slot() else {
            return Ok(None);
        };
        self.block.entries[slot] = FolderEntry {
            name: name.to_owned(),
            inode: raw_inode(inode)?,
        };
        Ok(Some(slot))
    }

    /// Clear the entry called `name`, returning the inode it pointed at.
    pub fn remove(&mut self, name: &str) -> Option<InodeIndex> {
        let (slot, ino) = self.find(name)?;
        self.block.entries[slot] = FolderEntry::free();
        Some(ino)
    }

    /// Rewrite the name of entry `old` in place. Returns whether it existed.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<bool> {
        validate_name(new)?;
        let Some((slot, _)) = self.find(old) else {
            return Ok(false);
        };
        new.clone_into(&mut self.block.entries[slot].name);
        Ok(true)
    }

    /// Point `..` at `parent`. Only valid on a first block.
    pub fn set_parent(&mut self, parent: InodeIndex) -> Result<()> {
        if !self.first {
            return Err(VdfsError::InvalidArgument(
                "'..' lives in the first directory block".to_owned(),
            ));
        }
        self.block.entries[1] = FolderEntry {
            name: DOTDOT.to_owned(),
            inode: raw_inode(parent)?,
        };
        Ok(())
    }
}

// ── Whole directories ───────────────────────────────────────────────────────

/// One child entry of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeIndex,
    pub block: BlockIndex,
    pub slot: usize,
}

fn ensure_dir(dir: &Inode) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(VdfsError::NotDirectory("inode is not a directory".to_owned()))
    }
}

fn load_blocks<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    dir: &Inode,
) -> Result<Vec<(BlockIndex, DirectoryBlock)>> {
    ensure_dir(dir)?;
    data_blocks(alloc, dir)?
        .into_iter()
        .enumerate()
        .map(|(logical, block)| {
            let folder: FolderBlock = read_block(alloc, block)?;
            Ok((block, DirectoryBlock::from_folder(folder, logical == 0)))
        })
        .collect()
}

/// Write the first block of a new directory and hook it into `inode`.
///
/// The caller writes `inode` back.
pub fn init_directory<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    self_ino: InodeIndex,
    inode: &mut Inode,
    parent: InodeIndex,
) -> Result<BlockIndex> {
    let block = allocate_block(alloc, inode, 0)?;
    let first = DirectoryBlock::new_first(self_ino, parent)?;
    write_block(alloc, block, first.as_folder())?;
    Ok(block)
}

/// Children of `dir` in block and slot order.
pub fn list<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, dir: &Inode) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    for (block, dblock) in load_blocks(alloc, dir)? {
        out.extend(dblock.children().map(|(slot, name, inode)| DirEntry {
            name: name.to_owned(),
            inode,
            block,
            slot,
        }));
    }
    Ok(out)
}

pub fn lookup<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    dir: &Inode,
    name: &str,
) -> Result<Option<InodeIndex>> {
    Ok(load_blocks(alloc, dir)?
        .iter()
        .find_map(|(_, dblock)| dblock.find(name).map(|(_, ino)| ino)))
}

/// Inode that `..` points at.
pub fn parent_of<D: ByteDevice + ?Sized>(alloc: &Allocator<'_, D>, dir: &Inode) -> Result<Option<InodeIndex>> {
    Ok(load_blocks(alloc, dir)?.first().and_then(|(_, dblock)| {
        dblock
            .entries()
            .find(|(_, name, _)| *name == DOTDOT)
            .map(|(_, _, ino)| ino)
    }))
}

/// Add `name → child` to the directory `dir_ino`.
///
/// With `grow`, a new block is appended when every slot is taken; otherwise
/// a full directory fails `NoSpace`. The updated inode is written back.
pub fn insert<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    dir_ino: InodeIndex,
    dir: &mut Inode,
    name: &str,
    child: InodeIndex,
    grow: bool,
) -> Result<()> {
    validate_name(name)?;
    let blocks = load_blocks(alloc, dir)?;
    if blocks.iter().any(|(_, dblock)| dblock.find(name).is_some()) {
        return Err(VdfsError::Exists(name.to_owned()));
    }
    for (block, mut dblock) in blocks.iter().cloned() {
        if dblock.insert(name, child)?.is_some() {
            write_block(alloc, block, dblock.as_folder())?;
            tracing::trace!(%dir_ino, name, %child, %block, "inserted entry");
            return Ok(());
        }
    }
    if !grow {
        return Err(VdfsError::NoSpace);
    }

    let logical = blocks.len();
    let block = match allocate_block(alloc, dir, logical) {
        Ok(block) => block,
        Err(err) => {
            // Any pointer block allocated on the way is now referenced by
            // `dir`; persist it so a later release can find it.
            write_inode(alloc, dir_ino, dir)?;
            return Err(err);
        }
    };
    let mut dblock = if logical == 0 {
        DirectoryBlock::new_first(dir_ino, dir_ino)?
    } else {
        DirectoryBlock::empty()
    };
    dblock.insert(name, child)?;
    write_block(alloc, block, dblock.as_folder())?;
    write_inode(alloc, dir_ino, dir)?;
    tracing::debug!(%dir_ino, logical, %block, "directory grew by one block");
    Ok(())
}

/// Clear the entry `name`. Returns the inode it referenced.
pub fn remove<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    dir: &Inode,
    name: &str,
) -> Result<Option<InodeIndex>> {
    for (block, mut dblock) in load_blocks(alloc, dir)? {
        if let Some(ino) = dblock.remove(name) {
            write_block(alloc, block, dblock.as_folder())?;
            return Ok(Some(ino));
        }
    }
    Ok(None)
}

/// Rename `old` to `new` inside `dir`.
pub fn rename<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    dir: &Inode,
    old: &str,
    new: &str,
) -> Result<()> {
    validate_name(new)?;
    let blocks = load_blocks(alloc, dir)?;
    let collides = blocks
        .iter()
        .any(|(_, dblock)| dblock.find(new).is_some());
    // Changing only the case of a name is not a collision with itself.
    if collides && !old.eq_ignore_ascii_case(new) {
        return Err(VdfsError::Exists(new.to_owned()));
    }
    for (block, mut dblock) in blocks {
        if dblock.rename(old, new)? {
            write_block(alloc, block, dblock.as_folder())?;
            return Ok(());
        }
    }
    Err(VdfsError::NotFound(old.to_owned()))
}

/// Repoint `..` of `dir` at `parent`.
pub fn set_parent<D: ByteDevice + ?Sized>(
    alloc: &Allocator<'_, D>,
    dir: &Inode,
    parent: InodeIndex,
) -> Result<()> {
    let mut blocks = load_blocks(alloc, dir)?;
    let Some((block, dblock)) = blocks.first_mut() else {
        return Err(VdfsError::Corruption {
            offset: 0,
            detail: "directory without a first block".to_owned(),
        });
    };
    dblock.set_parent(parent)?;
    write_block(alloc, *block, dblock.as_folder())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdfs_alloc::{FsLayout, initialize};
    use vdfs_block::MemoryByteDevice;
    use vdfs_inode::{read_inode, write_inode};
    use vdfs_types::{ByteOffset, FsType, NodeKind, Permissions};

    // ── Block tests ─────────────────────────────────────────────────────

    #[test]
    fn first_block_reserves_dot_entries() {
        let mut block = DirectoryBlock::new_first(InodeIndex(3), InodeIndex(0)).expect("init");
        let all: Vec<_> = block.entries().collect();
        assert_eq!(all, vec![(0, ".", InodeIndex(3)), (1, "..", InodeIndex(0))]);
        assert_eq!(block.children().count(), 0);
        assert_eq!(block.insert("a", InodeIndex(4)).expect("insert"), Some(2));
        assert_eq!(block.insert("b", InodeIndex(5)).expect("insert"), Some(3));
        assert_eq!(block.insert("c", InodeIndex(6)).expect("insert"), None);
        assert!(!block.has_free_slot());
    }

    #[test]
    fn overflow_block_uses_all_four_slots() {
        let mut block = DirectoryBlock::empty();
        for i in 0..4 {
            assert_eq!(block.insert(&format!("f{i}"), InodeIndex(i)).expect("insert"), Some(i as usize));
        }
        assert_eq!(block.insert("f4", InodeIndex(9)).expect("insert"), None);
    }

    #[test]
    fn find_is_case_insensitive_and_skips_dots() {
        let mut block = DirectoryBlock::new_first(InodeIndex(2), InodeIndex(0)).expect("init");
        block.insert("Docs", InodeIndex(7)).expect("insert");
        assert_eq!(block.find("docs"), Some((2, InodeIndex(7))));
        assert_eq!(block.find(".."), None);
    }

    #[test]
    fn remove_and_rename() {
        let mut block = DirectoryBlock::empty();
        block.insert("old", InodeIndex(1)).expect("insert");
        assert!(block.rename("old", "new").expect("rename"));
        assert!(!block.rename("missing", "x").expect("rename"));
        assert_eq!(block.remove("new"), Some(InodeIndex(1)));
        assert_eq!(block.remove("new"), None);
        assert!(block.as_folder().entries[0].is_free());
    }

    #[test]
    fn names_are_validated() {
        let mut block = DirectoryBlock::empty();
        assert!(block.insert("", InodeIndex(1)).is_err());
        assert!(block.insert("a/b", InodeIndex(1)).is_err());
        assert!(block.insert("..", InodeIndex(1)).is_err());
        assert!(block.insert("thirteen-char", InodeIndex(1)).is_err());
        assert!(block.insert("twelve-chars", InodeIndex(1)).is_ok());
    }

    #[test]
    fn set_parent_requires_first_block() {
        let mut block = DirectoryBlock::empty();
        assert!(block.set_parent(InodeIndex(0)).is_err());
        let mut first = DirectoryBlock::new_first(InodeIndex(4), InodeIndex(0)).expect("init");
        first.set_parent(InodeIndex(2)).expect("set");
        assert!(first.entries().any(|e| e == (1, "..", InodeIndex(2))));
    }

    // ── Directory tests ─────────────────────────────────────────────────

    fn fixture(inodes: u64) -> (MemoryByteDevice, InodeIndex) {
        let size = 76 + inodes * 284;
        let dev = MemoryByteDevice::new(size as usize);
        let layout = FsLayout::compute(0, size, FsType::Ext2, 0).expect("layout");
        initialize(&dev, &layout, size, 0.0).expect("init");
        let alloc = Allocator::new(&dev, ByteOffset(0));
        let ino = alloc.find_free_inode().expect("inode");
        let mut inode = Inode::new(NodeKind::Directory, Permissions::FULL, 1, 1, 0.0);
        init_directory(&alloc, ino, &mut inode, ino).expect("init dir");
        write_inode(&alloc, ino, &inode).expect("write");
        (dev, ino)
    }

    #[test]
    fn directory_grows_past_first_block() {
        let (dev, root) = fixture(20);
        let alloc = Allocator::new(&dev, ByteOffset(0));
        for i in 0..7_u32 {
            let mut dir = read_inode(&alloc, root).expect("read");
            insert(&alloc, root, &mut dir, &format!("e{i}"), InodeIndex(10 + i), true).expect("insert");
        }
        let dir = read_inode(&alloc, root).expect("read");
        // 2 slots in the first block, 4 in the second, 1 in the third.
        assert_eq!(data_blocks(&alloc, &dir).expect("blocks").len(), 3);
        let names: Vec<String> = list(&alloc, &dir).expect("list").into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["e0", "e1", "e2", "e3", "e4", "e5", "e6"]);
        assert_eq!(lookup(&alloc, &dir, "E6").expect("lookup"), Some(InodeIndex(16)));
    }

    #[test]
    fn insert_without_growth_reports_no_space() {
        let (dev, root) = fixture(10);
        let alloc = Allocator::new(&dev, ByteOffset(0));
        let mut dir = read_inode(&alloc, root).expect("read");
        insert(&alloc, root, &mut dir, "a", InodeIndex(5), false).expect("a");
        insert(&alloc, root, &mut dir, "b", InodeIndex(6), false).expect("b");
        let err = insert(&alloc, root, &mut dir, "c", InodeIndex(7), false).unwrap_err();
        assert!(matches!(err, VdfsError::NoSpace), "got {err:?}");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (dev, root) = fixture(10);
        let alloc = Allocator::new(&dev, ByteOffset(0));
        let mut dir = read_inode(&alloc, root).expect("read");
        insert(&alloc, root, &mut dir, "dup", InodeIndex(5), true).expect("first");
        let err = insert(&alloc, root, &mut dir, "DUP", InodeIndex(6), true).unwrap_err();
        assert!(matches!(err, VdfsError::Exists(_)), "got {err:?}");
    }

    #[test]
    fn rename_collision_leaves_entries_unchanged() {
        let (dev, root) = fixture(10);
        let alloc = Allocator::new(&dev, ByteOffset(0));
        let mut dir = read_inode(&alloc, root).expect("read");
        insert(&alloc, root, &mut dir, "a", InodeIndex(5), true).expect("a");
        insert(&alloc, root, &mut dir, "b", InodeIndex(6), true).expect("b");
        let err = rename(&alloc, &dir, "a", "b").unwrap_err();
        assert!(matches!(err, VdfsError::Exists(_)));
        assert_eq!(lookup(&alloc, &dir, "a").unwrap(), Some(InodeIndex(5)));
        assert_eq!(lookup(&alloc, &dir, "b").unwrap(), Some(InodeIndex(6)));
        rename(&alloc, &dir, "a", "A").expect("case-only rename");
        assert!(matches!(
            rename(&alloc, &dir, "zzz", "q"),
            Err(VdfsError::NotFound(_))
        ));
    }

    #[test]
    fn remove_and_parent_pointer() {
        let (dev, root) = fixture(10);
        let alloc = Allocator::new(&dev, ByteOffset(0));
        let mut dir = read_inode(&alloc, root).expect("read");
        insert(&alloc, root, &mut dir, "gone", InodeIndex(5), true).expect("insert");
        assert_eq!(remove(&alloc, &dir, "gone").unwrap(), Some(InodeIndex(5)));
        assert_eq!(remove(&alloc, &dir, "gone").unwrap(), None);
        assert_eq!(parent_of(&alloc, &dir).unwrap(), Some(root));
        set_parent(&alloc, &dir, InodeIndex(4)).expect("set parent");
        assert_eq!(parent_of(&alloc, &dir).unwrap(), Some(InodeIndex(4)));
    }

    #[test]
    fn file_inode_is_not_a_directory() {
        let (dev, _) = fixture(4);
        let alloc = Allocator::new(&dev, ByteOffset(0));
        let file = Inode::new(NodeKind::File, Permissions::FULL, 1, 1, 0.0);
        assert!(matches!(list(&alloc, &file), Err(VdfsError::NotDirectory(_))));
    }
}
