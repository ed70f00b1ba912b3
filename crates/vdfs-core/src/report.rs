//! Serializable dumps of on-disk structures.

use serde::Serialize;
use vdfs_alloc::{BitmapKind, bitmap_count_free};
use vdfs_block::ByteDevice;
use vdfs_error::Result;
use vdfs_inode::{collect_blocks, read_block};
use vdfs_ondisk::{FileBlock, FolderBlock, FolderEntry, Inode, PointerBlock};
use vdfs_types::{BlockIndex, InodeIndex, trim_nul_padded};

use crate::volume::Volume;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BitmapReport {
    pub kind: BitmapKind,
    pub total: u32,
    pub used: u32,
    pub free: u32,
    /// `0`/`1` per slot, 20 per line.
    pub map: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InodeReport {
    pub index: InodeIndex,
    pub inode: Inode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockContent {
    Folder { entries: Vec<FolderEntry> },
    File { text: String },
    Pointer { pointers: Vec<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub index: BlockIndex,
    pub owner: InodeIndex,
    pub content: BlockContent,
}

pub(crate) fn bitmap<D: ByteDevice + ?Sized>(vol: &Volume<'_, D>, kind: BitmapKind) -> Result<BitmapReport> {
    let alloc = vol.allocator();
    let sb = alloc.superblock()?;
    let (raw, total) = alloc.read_bitmap(&sb, kind)?;
    let free = bitmap_count_free(&raw, total);
    let recorded = match kind {
        BitmapKind::Inode => sb.free_inodes_count,
        BitmapKind::Block => sb.free_blocks_count,
    };
    if i64::from(free) != i64::from(recorded) {
        tracing::warn!(?kind, free, recorded, "superblock free counter disagrees with bitmap");
    }
    Ok(BitmapReport {
        kind,
        total,
        used: total - free,
        free,
        map: alloc.bitmap_dump(kind)?,
    })
}

pub(crate) fn inodes<D: ByteDevice + ?Sized>(vol: &Volume<'_, D>) -> Result<Vec<InodeReport>> {
    vol.allocator()
        .used_slots(BitmapKind::Inode)?
        .into_iter()
        .map(|slot| {
            let index = InodeIndex(slot);
            Ok(InodeReport {
                index,
                inode: vol.inode(index)?,
            })
        })
        .collect()
}

/// Every block reachable from a used inode, sorted by block index.
pub(crate) fn blocks<D: ByteDevice + ?Sized>(vol: &Volume<'_, D>) -> Result<Vec<BlockReport>> {
    let alloc = vol.allocator();
    let mut out = Vec::new();
    for report in inodes(vol)? {
        let set = collect_blocks(alloc, &report.inode)?;
        for block in set.pointers {
            let table: PointerBlock = read_block(alloc, block)?;
            out.push(BlockReport {
                index: block,
                owner: report.index,
                content: BlockContent::Pointer {
                    pointers: table.pointers.to_vec(),
                },
            });
        }
        for block in set.data {
            let content = if report.inode.is_dir() {
                let folder: FolderBlock = read_block(alloc, block)?;
                BlockContent::Folder {
                    entries: folder.entries.to_vec(),
                }
            } else {
                let chunk: FileBlock = read_block(alloc, block)?;
                BlockContent::File {
                    text: trim_nul_padded(&chunk.data),
                }
            };
            out.push(BlockReport {
                index: block,
                owner: report.index,
                content,
            });
        }
    }
    out.sort_by_key(|report| report.index);
    Ok(out)
}
