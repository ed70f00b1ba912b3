//! Filesystem records: superblock, inodes and the three 64-byte block
//! flavours.

use crate::{OnDiskRecord, ensure_len, put};
use serde::{Deserialize, Serialize};
use vdfs_types::{
    BLOCK_SIZE, BlockIndex, ByteOffset, FOLDER_ENTRIES, FOLDER_NAME_LEN, FsType,
    INODE_BLOCK_SLOTS, INODE_SIZE, InodeIndex, JOURNAL_ENTRY_SIZE, NULL_POINTER, NodeKind,
    POINTERS_PER_BLOCK, ParseError, Permissions, SUPERBLOCK_SIZE, VDFS_MAGIC, ensure_slice,
    nul_padded, read_fixed, read_le_f32, read_le_f64, read_le_i32, read_u8, trim_nul_padded,
};

// ── SuperBlock ──────────────────────────────────────────────────────────────

/// Per-partition filesystem header, stored at the partition start.
///
/// `inodes_count` and `blocks_count` hold the number of *used* slots. All
/// `*_start` fields are absolute image offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperBlock {
    pub fs_type: i32,
    pub inodes_count: i32,
    pub blocks_count: i32,
    pub free_blocks_count: i32,
    pub free_inodes_count: i32,
    pub mtime: f64,
    pub umtime: f64,
    pub mnt_count: i32,
    pub magic: i32,
    pub inode_size: i32,
    pub block_size: i32,
    pub first_ino: i32,
    pub first_blo: i32,
    pub bm_inode_start: i32,
    pub bm_block_start: i32,
    pub inode_start: i32,
    pub block_start: i32,
}

impl SuperBlock {
    pub fn fs_type(&self) -> Result<FsType, ParseError> {
        FsType::from_code(self.fs_type)
    }

    /// Number of inode slots (`n`).
    #[must_use]
    pub fn inode_capacity(&self) -> u32 {
        u32::try_from(self.bm_block_start - self.bm_inode_start).unwrap_or(0)
    }

    /// Number of block slots (`3n`).
    #[must_use]
    pub fn block_capacity(&self) -> u32 {
        u32::try_from(self.inode_start - self.bm_block_start).unwrap_or(0)
    }

    #[must_use]
    pub fn inode_offset(&self, inode: InodeIndex) -> Option<ByteOffset> {
        if inode.0 >= self.inode_capacity() {
            return None;
        }
        ByteOffset::from_start(self.inode_start)
            .ok()?
            .record(inode.0, INODE_SIZE)
    }

    #[must_use]
    pub fn block_offset(&self, block: BlockIndex) -> Option<ByteOffset> {
        if block.0 >= self.block_capacity() {
            return None;
        }
        ByteOffset::from_start(self.block_start)
            .ok()?
            .record(block.0, BLOCK_SIZE)
    }

    /// Start of a journal table of `entries` slots, which sits right before
    /// the inode bitmap.
    #[must_use]
    pub fn journal_start(&self, entries: u32) -> Option<ByteOffset> {
        let table = u64::from(entries).checked_mul(JOURNAL_ENTRY_SIZE as u64)?;
        ByteOffset::from_start(self.bm_inode_start)
            .ok()?
            .checked_sub(table)
    }
}

impl OnDiskRecord for SuperBlock {
    const SIZE: usize = SUPERBLOCK_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, SUPERBLOCK_SIZE)?;
        let magic = read_le_i32(bytes, 40)?;
        if magic != VDFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: VDFS_MAGIC as u64,
                actual: u64::from(magic as u32),
            });
        }
        let sb = Self {
            fs_type: read_le_i32(bytes, 0)?,
            inodes_count: read_le_i32(bytes, 4)?,
            blocks_count: read_le_i32(bytes, 8)?,
            free_blocks_count: read_le_i32(bytes, 12)?,
            free_inodes_count: read_le_i32(bytes, 16)?,
            mtime: read_le_f64(bytes, 20)?,
            umtime: read_le_f64(bytes, 28)?,
            mnt_count: read_le_i32(bytes, 36)?,
            magic,
            inode_size: read_le_i32(bytes, 44)?,
            block_size: read_le_i32(bytes, 48)?,
            first_ino: read_le_i32(bytes, 52)?,
            first_blo: read_le_i32(bytes, 56)?,
            bm_inode_start: read_le_i32(bytes, 60)?,
            bm_block_start: read_le_i32(bytes, 64)?,
            inode_start: read_le_i32(bytes, 68)?,
            block_start: read_le_i32(bytes, 72)?,
        };
        sb.fs_type()?;
        if sb.inode_size != INODE_SIZE as i32 || sb.block_size != BLOCK_SIZE as i32 {
            return Err(ParseError::InvalidField {
                field: "record_size",
                reason: "inode size must be 88 and block size 64",
            });
        }
        if !(sb.bm_inode_start <= sb.bm_block_start
            && sb.bm_block_start <= sb.inode_start
            && sb.inode_start <= sb.block_start)
        {
            return Err(ParseError::InvalidField {
                field: "layout",
                reason: "region starts out of order",
            });
        }
        Ok(sb)
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, SUPERBLOCK_SIZE)?;
        put(buf, 0, &self.fs_type.to_le_bytes());
        put(buf, 4, &self.inodes_count.to_le_bytes());
        put(buf, 8, &self.blocks_count.to_le_bytes());
        put(buf, 12, &self.free_blocks_count.to_le_bytes());
        put(buf, 16, &self.free_inodes_count.to_le_bytes());
        put(buf, 20, &self.mtime.to_le_bytes());
        put(buf, 28, &self.umtime.to_le_bytes());
        put(buf, 36, &self.mnt_count.to_le_bytes());
        put(buf, 40, &self.magic.to_le_bytes());
        put(buf, 44, &self.inode_size.to_le_bytes());
        put(buf, 48, &self.block_size.to_le_bytes());
        put(buf, 52, &self.first_ino.to_le_bytes());
        put(buf, 56, &self.first_blo.to_le_bytes());
        put(buf, 60, &self.bm_inode_start.to_le_bytes());
        put(buf, 64, &self.bm_block_start.to_le_bytes());
        put(buf, 68, &self.inode_start.to_le_bytes());
        put(buf, 72, &self.block_start.to_le_bytes());
        Ok(())
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    pub uid: i32,
    pub gid: i32,
    pub size: i32,
    pub atime: f32,
    pub ctime: f32,
    pub mtime: f32,
    pub kind: NodeKind,
    pub perm: Permissions,
    pub block: [i32; INODE_BLOCK_SLOTS],
}

impl Inode {
    /// Fresh inode with no blocks, all timestamps set to `now`.
    #[must_use]
    pub fn new(kind: NodeKind, perm: Permissions, uid: i32, gid: i32, now: f32) -> Self {
        Self {
            uid,
            gid,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            kind,
            perm,
            block: [NULL_POINTER; INODE_BLOCK_SLOTS],
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

impl OnDiskRecord for Inode {
    const SIZE: usize = INODE_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_SIZE)?;
        let mut block = [NULL_POINTER; INODE_BLOCK_SLOTS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_i32(bytes, 28 + i * 4)?;
        }
        Ok(Self {
            uid: read_le_i32(bytes, 0)?,
            gid: read_le_i32(bytes, 4)?,
            size: read_le_i32(bytes, 8)?,
            atime: read_le_f32(bytes, 12)?,
            ctime: read_le_f32(bytes, 16)?,
            mtime: read_le_f32(bytes, 20)?,
            kind: NodeKind::from_byte(read_u8(bytes, 24)?)?,
            perm: Permissions::from_bytes(read_fixed::<3>(bytes, 25)?)?,
            block,
        })
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, INODE_SIZE)?;
        put(buf, 0, &self.uid.to_le_bytes());
        put(buf, 4, &self.gid.to_le_bytes());
        put(buf, 8, &self.size.to_le_bytes());
        put(buf, 12, &self.atime.to_le_bytes());
        put(buf, 16, &self.ctime.to_le_bytes());
        put(buf, 20, &self.mtime.to_le_bytes());
        buf[24] = self.kind.as_byte();
        put(buf, 25, &self.perm.as_bytes());
        for (i, ptr) in self.block.iter().enumerate() {
            put(buf, 28 + i * 4, &ptr.to_le_bytes());
        }
        Ok(())
    }
}

// ── Blocks ──────────────────────────────────────────────────────────────────

/// Raw file content chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub data: [u8; BLOCK_SIZE],
}

impl FileBlock {
    /// Block holding `chunk` (at most 64 bytes), NUL padded.
    pub fn from_chunk(chunk: &[u8]) -> Result<Self, ParseError> {
        if chunk.len() > BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "file_block",
                reason: "chunk longer than a block",
            });
        }
        let mut data = [0_u8; BLOCK_SIZE];
        data[..chunk.len()].copy_from_slice(chunk);
        Ok(Self { data })
    }
}

impl OnDiskRecord for FileBlock {
    const SIZE: usize = BLOCK_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            data: read_fixed::<BLOCK_SIZE>(bytes, 0)?,
        })
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, BLOCK_SIZE)?;
        put(buf, 0, &self.data);
        Ok(())
    }
}

/// One `(name, inode)` slot in a directory block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    pub inode: i32,
}

impl FolderEntry {
    #[must_use]
    pub fn free() -> Self {
        Self {
            name: String::new(),
            inode: NULL_POINTER,
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.inode < 0 || self.name.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderBlock {
    pub entries: [FolderEntry; FOLDER_ENTRIES],
}

impl FolderBlock {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: std::array::from_fn(|_| FolderEntry::free()),
        }
    }
}

impl Default for FolderBlock {
    fn default() -> Self {
        Self::empty()
    }
}

impl OnDiskRecord for FolderBlock {
    const SIZE: usize = BLOCK_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, BLOCK_SIZE)?;
        let mut block = Self::empty();
        for (i, entry) in block.entries.iter_mut().enumerate() {
            let at = i * (FOLDER_NAME_LEN + 4);
            entry.name = trim_nul_padded(&read_fixed::<FOLDER_NAME_LEN>(bytes, at)?);
            entry.inode = read_le_i32(bytes, at + FOLDER_NAME_LEN)?;
        }
        Ok(block)
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, BLOCK_SIZE)?;
        for (i, entry) in self.entries.iter().enumerate() {
            let at = i * (FOLDER_NAME_LEN + 4);
            put(buf, at, &nul_padded::<FOLDER_NAME_LEN>(&entry.name, "entry_name")?);
            put(buf, at + FOLDER_NAME_LEN, &entry.inode.to_le_bytes());
        }
        Ok(())
    }
}

/// Indirection block: 16 little-endian `i32` pointers, `-1` when unused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerBlock {
    pub pointers: [i32; POINTERS_PER_BLOCK],
}

impl PointerBlock {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            pointers: [NULL_POINTER; POINTERS_PER_BLOCK],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pointers.iter().all(|p| *p < 0)
    }
}

impl Default for PointerBlock {
    fn default() -> Self {
        Self::empty()
    }
}

impl OnDiskRecord for PointerBlock {
    const SIZE: usize = BLOCK_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, BLOCK_SIZE)?;
        let mut block = Self::empty();
        for (i, ptr) in block.pointers.iter_mut().enumerate() {
            *ptr = read_le_i32(bytes, i * 4)?;
        }
        Ok(block)
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, BLOCK_SIZE)?;
        for (i, ptr) in self.pointers.iter().enumerate() {
            put(buf, i * 4, &ptr.to_le_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> SuperBlock {
        SuperBlock {
            fs_type: 2,
            inodes_count: 2,
            blocks_count: 2,
            free_blocks_count: 28,
            free_inodes_count: 8,
            mtime: 1.7e9,
            umtime: 0.0,
            mnt_count: 1,
            magic: VDFS_MAGIC,
            inode_size: INODE_SIZE as i32,
            block_size: BLOCK_SIZE as i32,
            first_ino: 0,
            first_blo: 0,
            bm_inode_start: 1076,
            bm_block_start: 1086,
            inode_start: 1116,
            block_start: 1996,
        }
    }

    #[test]
    fn superblock_field_offsets() {
        let sb = sample_superblock();
        let bytes = sb.to_bytes().expect("encode");
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        assert_eq!(&bytes[40..44], &VDFS_MAGIC.to_le_bytes());
        assert_eq!(&bytes[44..48], &88_i32.to_le_bytes());
        assert_eq!(&bytes[72..76], &1996_i32.to_le_bytes());
        assert_eq!(SuperBlock::parse_from_bytes(&bytes).expect("parse"), sb);
    }

    #[test]
    fn superblock_geometry_helpers() {
        let sb = sample_superblock();
        assert_eq!(sb.inode_capacity(), 10);
        assert_eq!(sb.block_capacity(), 30);
        assert_eq!(sb.inode_offset(InodeIndex(1)), Some(ByteOffset(1116 + 88)));
        assert_eq!(sb.inode_offset(InodeIndex(10)), None);
        assert_eq!(sb.block_offset(BlockIndex(29)), Some(ByteOffset(1996 + 29 * 64)));
        assert_eq!(sb.block_offset(BlockIndex(30)), None);
        assert_eq!(sb.journal_start(2), Some(ByteOffset(1076 - 228)));
    }

    #[test]
    fn superblock_rejects_bad_magic_and_sizes() {
        let mut bytes = sample_superblock().to_bytes().expect("encode");
        bytes[40..44].copy_from_slice(&0_i32.to_le_bytes());
        assert!(matches!(
            SuperBlock::parse_from_bytes(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut sb = sample_superblock();
        sb.block_size = 128;
        let bytes = sb.to_bytes().expect("encode");
        assert!(matches!(
            SuperBlock::parse_from_bytes(&bytes),
            Err(ParseError::InvalidField { field: "record_size", .. })
        ));
    }

    #[test]
    fn inode_layout() {
        let mut inode = Inode::new(NodeKind::File, Permissions::parse("664").unwrap(), 1, 1, 5.0);
        inode.size = 27;
        inode.block[0] = 1;
        let bytes = inode.to_bytes().expect("encode");
        assert_eq!(bytes.len(), INODE_SIZE);
        assert_eq!(bytes[24], b'1');
        assert_eq!(&bytes[25..28], b"664");
        assert_eq!(&bytes[28..32], &1_i32.to_le_bytes());
        assert_eq!(&bytes[32..36], &(-1_i32).to_le_bytes());
        assert_eq!(Inode::parse_from_bytes(&bytes).expect("parse"), inode);
    }

    #[test]
    fn zeroed_inode_does_not_decode() {
        assert!(Inode::parse_from_bytes(&[0_u8; INODE_SIZE]).is_err());
    }

    #[test]
    fn folder_block_entries() {
        let mut block = FolderBlock::empty();
        block.entries[0] = FolderEntry {
            name: ".".to_owned(),
            inode: 0,
        };
        block.entries[2] = FolderEntry {
            name: "users.txt".to_owned(),
            inode: 1,
        };
        let bytes = block.to_bytes().expect("encode");
        assert_eq!(&bytes[32..41], b"users.txt");
        assert_eq!(&bytes[44..48], &1_i32.to_le_bytes());
        assert_eq!(&bytes[60..64], &(-1_i32).to_le_bytes());
        let parsed = FolderBlock::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, block);
        assert!(parsed.entries[3].is_free());
        // A zero-filled block reads as all free.
        let zeroed = FolderBlock::parse_from_bytes(&[0_u8; BLOCK_SIZE]).expect("parse");
        assert!(zeroed.entries.iter().all(FolderEntry::is_free));
    }

    #[test]
    fn pointer_block_is_sixty_four_bytes() {
        let mut block = PointerBlock::empty();
        assert!(block.is_empty());
        block.pointers[15] = 99;
        let bytes = block.to_bytes().expect("encode");
        assert_eq!(bytes.len(), BLOCK_SIZE);
        assert_eq!(&bytes[60..64], &99_i32.to_le_bytes());
        assert!(!PointerBlock::parse_from_bytes(&bytes).expect("parse").is_empty());
    }

    #[test]
    fn file_block_pads_with_nul() {
        let block = FileBlock::from_chunk(b"hi").expect("chunk");
        assert_eq!(&block.data[..2], b"hi");
        assert!(block.data[2..].iter().all(|b| *b == 0));
        assert!(FileBlock::from_chunk(&[1_u8; 65]).is_err());
    }
}
