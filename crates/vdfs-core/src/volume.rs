//! Handle on one formatted partition.
//!
//! A [`Volume`] borrows an open device, re-reads the superblock on every
//! allocator call and carries the identity used for permission checks.
//! Tree operations live in `tree.rs`; this module holds construction,
//! formatting, path resolution and traversal.

use std::collections::HashSet;
use vdfs_alloc::{Allocator, FsLayout, initialize};
use vdfs_block::ByteDevice;
use vdfs_dir as dir;
use vdfs_error::{Result, VdfsError};
use vdfs_inode::{Credentials, read_inode, write_data, write_inode};
use vdfs_journal::{Journal, JournalOp};
use vdfs_ondisk::{Inode, SuperBlock, parse_to_vdfs_error};
use vdfs_types::{
    ByteOffset, FsType, InodeIndex, JOURNAL_ENTRY_SIZE, NodeKind, PERM_READ, PERM_WRITE,
    Permissions, SUPERBLOCK_SIZE, USERS_FILE_NAME, USERS_FILE_PATH, unix_now,
};

pub(crate) fn now() -> f32 {
    unix_now() as f32
}

pub(crate) fn journal_date() -> u32 {
    unix_now() as u32
}

/// Number of journal slots between the superblock and the inode bitmap.
fn journal_slots(sb: &SuperBlock, start: ByteOffset) -> Result<u32> {
    let table_start = start.0 + SUPERBLOCK_SIZE as u64;
    let bm = u64::try_from(sb.bm_inode_start).unwrap_or(0);
    let bytes = bm.checked_sub(table_start).ok_or_else(|| VdfsError::Corruption {
        offset: start.0,
        detail: format!("inode bitmap at {bm} precedes the journal table"),
    })?;
    u32::try_from(bytes / JOURNAL_ENTRY_SIZE as u64)
        .map_err(|_| VdfsError::Format(format!("journal table of {bytes} bytes")))
}

/// Split an absolute path into its components.
pub(crate) fn components(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(VdfsError::InvalidArgument(format!(
            "path {path:?} must be absolute"
        )));
    }
    Ok(path.split('/').filter(|c| !c.is_empty()).collect())
}

pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn render(comps: &[&str]) -> String {
    format!("/{}", comps.join("/"))
}

/// Topmost directory created on the way to a path: its parent and name.
pub(crate) type Created<'p> = Option<(InodeIndex, &'p str)>;

/// One node reached by [`Volume::walk`].
#[derive(Debug, Clone)]
pub(crate) struct Visit {
    pub path: String,
    pub ino: InodeIndex,
    pub inode: Inode,
    pub depth: usize,
}

pub struct Volume<'a, D: ByteDevice + ?Sized> {
    pub(crate) alloc: Allocator<'a, D>,
    pub(crate) journal: Option<Journal<'a, D>>,
    pub(crate) creds: Credentials,
    pub(crate) file_perm: Permissions,
    pub(crate) dir_perm: Permissions,
    /// Append journal entries for mutations. Off during replay.
    pub(crate) record: bool,
}

impl<'a, D: ByteDevice + ?Sized> Volume<'a, D> {
    /// Open the filesystem whose superblock sits at `start`.
    pub fn open(dev: &'a D, start: ByteOffset, creds: Credentials) -> Result<Self> {
        let alloc = Allocator::new(dev, start);
        let sb = alloc.superblock()?;
        let fs_type = sb.fs_type().map_err(|e| parse_to_vdfs_error(&e, start))?;
        let journal = if fs_type.has_journal() {
            Some(Journal::locate(dev, &sb, journal_slots(&sb, start)?)?)
        } else {
            None
        };
        Ok(Self {
            alloc,
            journal,
            creds,
            file_perm: Permissions::DEFAULT,
            dir_perm: Permissions::DEFAULT,
            record: true,
        })
    }

    #[must_use]
    pub fn with_default_perms(mut self, file: Permissions, dir: Permissions) -> Self {
        self.file_perm = file;
        self.dir_perm = dir;
        self
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator<'a, D> {
        &self.alloc
    }

    #[must_use]
    pub fn journal(&self) -> Option<&Journal<'a, D>> {
        self.journal.as_ref()
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    pub fn superblock(&self) -> Result<SuperBlock> {
        self.alloc.superblock()
    }

    pub(crate) fn log(&self, op: JournalOp, path: &str, payload: &str) -> Result<()> {
        if !self.record {
            return Ok(());
        }
        if let Some(journal) = &self.journal {
            journal.append(op, path, payload, journal_date())?;
        }
        Ok(())
    }

    pub(crate) fn inode(&self, ino: InodeIndex) -> Result<Inode> {
        read_inode(&self.alloc, ino)
    }

    pub(crate) fn require(&self, inode: &Inode, mask: u8, path: &str) -> Result<()> {
        if self.creds.can(inode, mask) {
            return Ok(());
        }
        let what = match mask {
            PERM_READ => "read",
            PERM_WRITE => "write",
            _ => "read/write",
        };
        Err(VdfsError::PermissionDenied(format!("{what} access to {path}")))
    }

    // ── Path resolution ─────────────────────────────────────────────────

    fn descend(&self, comps: &[&str]) -> Result<(InodeIndex, Inode)> {
        let mut ino = InodeIndex::ROOT;
        let mut inode = self.inode(ino)?;
        for (depth, name) in comps.iter().enumerate() {
            if !inode.is_dir() {
                return Err(VdfsError::NotDirectory(render(&comps[..depth])));
            }
            ino = dir::lookup(&self.alloc, &inode, name)?
                .ok_or_else(|| VdfsError::NotFound(render(&comps[..=depth])))?;
            inode = self.inode(ino)?;
        }
        Ok((ino, inode))
    }

    /// Inode at `path`.
    pub fn resolve(&self, path: &str) -> Result<(InodeIndex, Inode)> {
        self.descend(&components(path)?)
    }

    /// Directory holding the last component of `path`, plus that name.
    /// The root has no parent and fails `InvalidArgument`.
    pub(crate) fn resolve_parent<'p>(&self, path: &'p str) -> Result<(InodeIndex, Inode, &'p str)> {
        let comps = components(path)?;
        let Some((name, parents)) = comps.split_last() else {
            return Err(VdfsError::InvalidArgument(
                "operation not allowed on /".to_owned(),
            ));
        };
        let (ino, inode) = self.descend(parents)?;
        if !inode.is_dir() {
            return Err(VdfsError::NotDirectory(render(parents)));
        }
        Ok((ino, inode, *name))
    }

    /// Directory at `path`, creating missing components when `parents`.
    ///
    /// Also returns the topmost directory created, as `(parent, name)`, so a
    /// caller whose next step fails can hand it to [`Volume::undo_created`].
    /// A failure inside this call already removes what it created.
    pub(crate) fn ensure_dir<'p>(&self, comps: &[&'p str], parents: bool) -> Result<(InodeIndex, Created<'p>)> {
        let mut created = None;
        match self.descend_creating(comps, parents, &mut created) {
            Ok(ino) => Ok((ino, created)),
            Err(err) => {
                self.undo_created(created)?;
                Err(err)
            }
        }
    }

    fn descend_creating<'p>(&self, comps: &[&'p str], parents: bool, created: &mut Created<'p>) -> Result<InodeIndex> {
        let mut ino = InodeIndex::ROOT;
        let mut inode = self.inode(ino)?;
        for (depth, name) in comps.iter().enumerate() {
            if !inode.is_dir() {
                return Err(VdfsError::NotDirectory(render(&comps[..depth])));
            }
            ino = match dir::lookup(&self.alloc, &inode, name)? {
                Some(found) => found,
                None if parents => {
                    let fresh = self.create_node(ino, name, NodeKind::Directory, &[])?;
                    if created.is_none() {
                        *created = Some((ino, *name));
                    }
                    fresh
                }
                None => return Err(VdfsError::NotFound(render(&comps[..=depth]))),
            };
            inode = self.inode(ino)?;
        }
        if inode.is_dir() {
            Ok(ino)
        } else {
            Err(VdfsError::NotDirectory(render(comps)))
        }
    }

    /// Remove the directories [`Volume::ensure_dir`] created.
    pub(crate) fn undo_created(&self, created: Created<'_>) -> Result<()> {
        let Some((parent, name)) = created else {
            return Ok(());
        };
        tracing::debug!(%parent, name, "removing parents created by a failed operation");
        self.discard(parent, name)
    }

    /// Pass `result` through, removing `created` first when it is an error.
    pub(crate) fn or_undo<T>(&self, created: Created<'_>, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.undo_created(created)?;
        }
        result
    }

    // ── Node creation ───────────────────────────────────────────────────

    /// Allocate an inode of `kind` under `parent_ino` and link it as `name`.
    /// Everything allocated is released again if a step fails.
    pub(crate) fn create_node(
        &self,
        parent_ino: InodeIndex,
        name: &str,
        kind: NodeKind,
        content: &[u8],
    ) -> Result<InodeIndex> {
        dir::validate_name(name)?;
        let parent = self.inode(parent_ino)?;
        self.require(&parent, PERM_WRITE, name)?;
        if dir::lookup(&self.alloc, &parent, name)?.is_some() {
            return Err(VdfsError::Exists(name.to_owned()));
        }

        let ino = self.alloc.find_free_inode()?;
        let perm = match kind {
            NodeKind::Directory => self.dir_perm,
            NodeKind::File => self.file_perm,
        };
        let mut inode = vdfs_inode::new_inode(kind, perm, &self.creds, now());
        if let Err(err) = self.fill_node(parent_ino, parent, ino, &mut inode, name, content) {
            tracing::debug!(%ino, name, error = %err, "create failed, releasing inode");
            vdfs_inode::release_blocks(&self.alloc, &mut inode)?;
            self.alloc.free_inode(ino)?;
            return Err(err);
        }
        tracing::debug!(%ino, %parent_ino, name, %kind, "node created");
        Ok(ino)
    }

    fn fill_node(
        &self,
        parent_ino: InodeIndex,
        mut parent: Inode,
        ino: InodeIndex,
        inode: &mut Inode,
        name: &str,
        content: &[u8],
    ) -> Result<()> {
        if inode.is_dir() {
            dir::init_directory(&self.alloc, ino, inode, parent_ino)?;
        } else {
            write_data(&self.alloc, inode, content, now())?;
        }
        write_inode(&self.alloc, ino, inode)?;
        dir::insert(&self.alloc, parent_ino, &mut parent, name, ino, true)
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Free the blocks and inodes of `nodes`, children first.
    pub(crate) fn release_nodes(&self, nodes: &[Visit]) -> Result<()> {
        for visit in nodes.iter().rev() {
            let mut inode = visit.inode.clone();
            vdfs_inode::release_blocks(&self.alloc, &mut inode)?;
            self.alloc.free_inode(visit.ino)?;
        }
        Ok(())
    }

    /// Unlink `name` from `parent_ino` and free its whole subtree, without
    /// permission checks or a journal entry. A missing name is a no-op.
    pub(crate) fn discard(&self, parent_ino: InodeIndex, name: &str) -> Result<()> {
        let parent = self.inode(parent_ino)?;
        let Some(ino) = dir::lookup(&self.alloc, &parent, name)? else {
            return Ok(());
        };
        let nodes = self.walk(name, ino, self.inode(ino)?, |_| true)?;
        dir::remove(&self.alloc, &parent, name)?;
        self.release_nodes(&nodes)
    }

    // ── Traversal ───────────────────────────────────────────────────────

    /// Pre-order walk from `path`. Directories for which `descend` returns
    /// false are visited but their children are not.
    pub(crate) fn walk(
        &self,
        path: &str,
        ino: InodeIndex,
        inode: Inode,
        descend: impl Fn(&Inode) -> bool,
    ) -> Result<Vec<Visit>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![Visit {
            path: path.to_owned(),
            ino,
            inode,
            depth: 0,
        }];
        while let Some(visit) = stack.pop() {
            if !seen.insert(visit.ino) {
                tracing::warn!(ino = %visit.ino, path = %visit.path, "inode reached twice, not descending");
                continue;
            }
            if visit.inode.is_dir() && descend(&visit.inode) {
                let children = dir::list(&self.alloc, &visit.inode)?;
                for entry in children.into_iter().rev() {
                    stack.push(Visit {
                        path: join(&visit.path, &entry.name),
                        ino: entry.inode,
                        inode: self.inode(entry.inode)?,
                        depth: visit.depth + 1,
                    });
                }
            }
            out.push(visit);
        }
        Ok(out)
    }

    /// Whether `candidate` lies in the subtree rooted at `ancestor`.
    pub(crate) fn is_within(&self, ancestor: InodeIndex, candidate: InodeIndex) -> Result<bool> {
        let mut current = candidate;
        let mut seen = HashSet::new();
        loop {
            if current == ancestor {
                return Ok(true);
            }
            if current == InodeIndex::ROOT || !seen.insert(current) {
                return Ok(false);
            }
            let inode = self.inode(current)?;
            match dir::parent_of(&self.alloc, &inode)? {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    // ── Seeding ─────────────────────────────────────────────────────────

    /// Create the root directory and `/users.txt` on wiped tables.
    pub(crate) fn seed(&self, users_content: &str) -> Result<()> {
        let now = now();
        let root_ino = self.alloc.find_free_inode()?;
        let users_ino = self.alloc.find_free_inode()?;
        if root_ino != InodeIndex::ROOT || users_ino != InodeIndex::USERS {
            return Err(VdfsError::Corruption {
                offset: self.alloc.superblock_offset().0,
                detail: format!("seeding expected empty tables, got inodes {root_ino} and {users_ino}"),
            });
        }
        let mut root = Inode::new(NodeKind::Directory, Permissions::FULL, 1, 1, now);
        dir::init_directory(&self.alloc, root_ino, &mut root, root_ino)?;
        write_inode(&self.alloc, root_ino, &root)?;

        let mut users = Inode::new(NodeKind::File, Permissions::FULL, 1, 1, now);
        write_data(&self.alloc, &mut users, users_content.as_bytes(), now)?;
        write_inode(&self.alloc, users_ino, &users)?;
        dir::insert(&self.alloc, root_ino, &mut root, USERS_FILE_NAME, users_ino, false)?;
        Ok(())
    }
}

/// Lay out a fresh filesystem on `[start, start + size)` and seed it.
pub fn format<D: ByteDevice + ?Sized>(
    dev: &D,
    start: u64,
    size: u64,
    fs_type: FsType,
    journal_entries: u32,
    users_content: &str,
) -> Result<SuperBlock> {
    let layout = FsLayout::compute(start, size, fs_type, journal_entries)?;
    initialize(dev, &layout, size, unix_now())?;
    let volume = Volume::open(dev, ByteOffset(start), Credentials::ROOT)?;
    volume.seed(users_content)?;
    if let Some(journal) = volume.journal() {
        let date = journal_date();
        journal.append(JournalOp::Mkdir, "/", "", date)?;
        journal.append(JournalOp::Mkfile, USERS_FILE_PATH, users_content, date)?;
    }
    let sb = volume.superblock()?;
    tracing::info!(
        start,
        size,
        ?fs_type,
        inodes = layout.inodes,
        blocks = layout.blocks(),
        "filesystem formatted"
    );
    Ok(sb)
}
