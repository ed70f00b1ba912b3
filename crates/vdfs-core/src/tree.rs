//! Directory-tree operations on a [`Volume`].
//!
//! Every operation takes absolute paths, checks permissions against the
//! volume's credentials and appends one journal entry on success when the
//! filesystem is journaled.

use serde::Serialize;
use std::collections::HashSet;
use vdfs_block::ByteDevice;
use vdfs_dir as dir;
use vdfs_error::{Result, VdfsError};
use vdfs_inode::{read_data, write_data, write_inode};
use vdfs_journal::JournalOp;
use vdfs_ondisk::Inode;
use vdfs_types::{InodeIndex, NodeKind, PERM_READ, PERM_WRITE, Permissions};

use crate::volume::{Visit, Volume, components, join, now};

/// Result of a recursive copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    /// Destination paths created, in traversal order.
    pub copied: Vec<String>,
    /// Source paths left out for lack of read permission.
    pub skipped: Vec<String>,
}

/// Nested view of a subtree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub inode: InodeIndex,
    pub kind: NodeKind,
    pub perm: Permissions,
    pub uid: i32,
    pub gid: i32,
    pub size: i32,
    pub children: Vec<TreeNode>,
}

/// Anchored, case-sensitive wildcard match: `*` matches any run of
/// characters and `?` exactly one.
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = name.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if p < pat.len() && (pat[p] == '?' || pat[p] == text[t]) {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    pat[p..].iter().all(|c| *c == '*')
}

fn last_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn lossy(content: &[u8]) -> String {
    String::from_utf8_lossy(content).into_owned()
}

impl<D: ByteDevice + ?Sized> Volume<'_, D> {
    // ── Create ──────────────────────────────────────────────────────────

    /// Create a directory. With `parents`, missing ancestors are created.
    pub fn mkdir(&self, path: &str, parents: bool) -> Result<InodeIndex> {
        let comps = components(path)?;
        let Some((name, ancestors)) = comps.split_last() else {
            return Err(VdfsError::Exists("/".to_owned()));
        };
        let (parent, created) = self.ensure_dir(ancestors, parents)?;
        let ino = self.or_undo(created, self.create_node(parent, name, NodeKind::Directory, &[]))?;
        self.log(JournalOp::Mkdir, path, "")?;
        Ok(ino)
    }

    /// Create a file holding `content`.
    pub fn mkfile(&self, path: &str, parents: bool, content: &[u8]) -> Result<InodeIndex> {
        let comps = components(path)?;
        let Some((name, ancestors)) = comps.split_last() else {
            return Err(VdfsError::IsDirectory("/".to_owned()));
        };
        let (parent, created) = self.ensure_dir(ancestors, parents)?;
        let ino = self.or_undo(created, self.create_node(parent, name, NodeKind::File, content))?;
        self.log(JournalOp::Mkfile, path, &lossy(content))?;
        Ok(ino)
    }

    /// Create `path` with parents, or replace its content if it exists.
    pub(crate) fn put_file(&self, path: &str, content: &[u8]) -> Result<InodeIndex> {
        let comps = components(path)?;
        let Some((name, ancestors)) = comps.split_last() else {
            return Err(VdfsError::IsDirectory("/".to_owned()));
        };
        let (parent_ino, created) = self.ensure_dir(ancestors, true)?;
        let parent = self.inode(parent_ino)?;
        match dir::lookup(&self.alloc, &parent, name)? {
            Some(ino) => {
                let mut inode = self.inode(ino)?;
                if inode.is_dir() {
                    return Err(VdfsError::IsDirectory(path.to_owned()));
                }
                write_data(&self.alloc, &mut inode, content, now())?;
                write_inode(&self.alloc, ino, &inode)?;
                Ok(ino)
            }
            None => self.or_undo(created, self.create_node(parent_ino, name, NodeKind::File, content)),
        }
    }

    // ── Read / edit ─────────────────────────────────────────────────────

    pub fn cat(&self, path: &str) -> Result<Vec<u8>> {
        let (_, inode) = self.resolve(path)?;
        if inode.is_dir() {
            return Err(VdfsError::IsDirectory(path.to_owned()));
        }
        self.require(&inode, PERM_READ, path)?;
        read_data(&self.alloc, &inode)
    }

    /// Replace a file's content. Needs read and write permission.
    pub fn edit(&self, path: &str, content: &[u8]) -> Result<()> {
        let (ino, mut inode) = self.resolve(path)?;
        if inode.is_dir() {
            return Err(VdfsError::IsDirectory(path.to_owned()));
        }
        self.require(&inode, PERM_READ | PERM_WRITE, path)?;
        write_data(&self.alloc, &mut inode, content, now())?;
        write_inode(&self.alloc, ino, &inode)?;
        self.log(JournalOp::Edit, path, &lossy(content))
    }

    // ── Remove / rename / move ──────────────────────────────────────────

    fn child_of(&self, parent: &Inode, name: &str, path: &str) -> Result<InodeIndex> {
        let ino = dir::lookup(&self.alloc, parent, name)?
            .ok_or_else(|| VdfsError::NotFound(path.to_owned()))?;
        if ino == InodeIndex::USERS {
            return Err(VdfsError::InvalidArgument(format!("{path} is reserved")));
        }
        Ok(ino)
    }

    /// Delete a file or a whole directory subtree. Returns the number of
    /// inodes freed. Nothing is freed unless every node is writable.
    pub fn remove(&self, path: &str) -> Result<usize> {
        let (_, parent, name) = self.resolve_parent(path)?;
        let ino = self.child_of(&parent, name, path)?;
        let inode = self.inode(ino)?;
        let nodes = self.walk(path, ino, inode, |_| true)?;
        if let Some(denied) = nodes
            .iter()
            .find(|visit| !self.creds.can(&visit.inode, PERM_WRITE))
        {
            return Err(VdfsError::PermissionDenied(format!(
                "write access to {}",
                denied.path
            )));
        }

        dir::remove(&self.alloc, &parent, name)?;
        self.release_nodes(&nodes)?;
        tracing::debug!(path, freed = nodes.len(), "removed subtree");
        self.log(JournalOp::Remove, path, "")?;
        Ok(nodes.len())
    }

    pub fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        let (_, parent, name) = self.resolve_parent(path)?;
        let ino = self.child_of(&parent, name, path)?;
        self.require(&self.inode(ino)?, PERM_WRITE, path)?;
        dir::rename(&self.alloc, &parent, name, new_name)?;
        self.log(JournalOp::Rename, path, new_name)
    }

    /// Move `path` into the directory `dest`. Only existing destination
    /// blocks are used; a moved directory has its `..` repointed.
    pub fn mv(&self, path: &str, dest: &str) -> Result<()> {
        let (_, src_parent, name) = self.resolve_parent(path)?;
        let ino = self.child_of(&src_parent, name, path)?;
        let inode = self.inode(ino)?;
        let (dest_ino, mut dest_dir) = self.resolve(dest)?;
        if !dest_dir.is_dir() {
            return Err(VdfsError::NotDirectory(dest.to_owned()));
        }
        self.require(&inode, PERM_WRITE, path)?;
        self.require(&dest_dir, PERM_WRITE, dest)?;
        if inode.is_dir() && self.is_within(ino, dest_ino)? {
            return Err(VdfsError::InvalidArgument(format!(
                "cannot move {path} into its own subtree"
            )));
        }

        let stored = dir::list(&self.alloc, &src_parent)?
            .into_iter()
            .find(|entry| entry.inode == ino)
            .map_or_else(|| name.to_owned(), |entry| entry.name);
        dir::insert(&self.alloc, dest_ino, &mut dest_dir, &stored, ino, false)?;
        if let Err(err) = dir::remove(&self.alloc, &src_parent, name) {
            tracing::debug!(path, dest, error = %err, "unlink from source failed, undoing link");
            dir::remove(&self.alloc, &dest_dir, &stored)?;
            return Err(err);
        }
        if inode.is_dir() {
            dir::set_parent(&self.alloc, &inode, dest_ino)?;
        }
        self.log(JournalOp::Move, path, dest)
    }

    // ── Copy ────────────────────────────────────────────────────────────

    /// Deep-copy `path` into the directory `dest`. Unreadable sources are
    /// skipped and reported. If any node fails to copy, the partial copy is
    /// removed again.
    pub fn copy(&self, path: &str, dest: &str) -> Result<CopyReport> {
        let comps = components(path)?;
        let Some(name) = comps.last() else {
            return Err(VdfsError::InvalidArgument("cannot copy /".to_owned()));
        };
        let (src_ino, src) = self.resolve(path)?;
        let (dest_ino, dest_dir) = self.resolve(dest)?;
        if !dest_dir.is_dir() {
            return Err(VdfsError::NotDirectory(dest.to_owned()));
        }
        self.require(&dest_dir, PERM_WRITE, dest)?;
        if src.is_dir() && self.is_within(src_ino, dest_ino)? {
            return Err(VdfsError::InvalidArgument(format!(
                "cannot copy {path} into itself"
            )));
        }
        if dir::lookup(&self.alloc, &dest_dir, name)?.is_some() {
            return Err(VdfsError::Exists(join(dest, name)));
        }

        let mut report = CopyReport::default();
        if let Err(err) = self.copy_node(path, &src, name, dest_ino, &join(dest, name), &mut report) {
            tracing::debug!(path, dest, copied = report.copied.len(), error = %err, "copy failed, removing partial copy");
            self.discard(dest_ino, name)?;
            return Err(err);
        }
        self.log(JournalOp::Copy, path, dest)?;
        Ok(report)
    }

    fn copy_node(
        &self,
        src_path: &str,
        src: &Inode,
        name: &str,
        dest_parent: InodeIndex,
        dest_path: &str,
        report: &mut CopyReport,
    ) -> Result<()> {
        if !self.creds.can(src, PERM_READ) {
            tracing::warn!(path = src_path, "copy skipped unreadable node");
            report.skipped.push(src_path.to_owned());
            return Ok(());
        }
        if !src.is_dir() {
            let content = read_data(&self.alloc, src)?;
            self.create_node(dest_parent, name, NodeKind::File, &content)?;
            report.copied.push(dest_path.to_owned());
            return Ok(());
        }
        let copy = self.create_node(dest_parent, name, NodeKind::Directory, &[])?;
        report.copied.push(dest_path.to_owned());
        for entry in dir::list(&self.alloc, src)? {
            let child = self.inode(entry.inode)?;
            self.copy_node(
                &join(src_path, &entry.name),
                &child,
                &entry.name,
                copy,
                &join(dest_path, &entry.name),
                report,
            )?;
        }
        Ok(())
    }

    // ── Ownership and mode ──────────────────────────────────────────────

    fn targets(&self, path: &str, recursive: bool) -> Result<Vec<Visit>> {
        let (ino, inode) = self.resolve(path)?;
        if recursive {
            self.walk(path, ino, inode, |_| true)
        } else {
            Ok(vec![Visit {
                path: path.to_owned(),
                ino,
                inode,
                depth: 0,
            }])
        }
    }

    /// Set the mode of `path` (and its subtree with `recursive`). Root only.
    pub fn chmod(&self, path: &str, perm: Permissions, recursive: bool) -> Result<usize> {
        if !self.creds.root {
            return Err(VdfsError::PermissionDenied("chmod requires root".to_owned()));
        }
        let targets = self.targets(path, recursive)?;
        for visit in &targets {
            let mut inode = visit.inode.clone();
            inode.perm = perm;
            write_inode(&self.alloc, visit.ino, &inode)?;
        }
        self.log(JournalOp::Chmod, path, &perm.to_string())?;
        Ok(targets.len())
    }

    /// Hand `path` to `uid`/`gid`. Returns the paths skipped because the
    /// caller does not own them.
    pub fn chown(&self, path: &str, user: &str, uid: i32, gid: i32, recursive: bool) -> Result<Vec<String>> {
        let targets = self.targets(path, recursive)?;
        let owns_top = targets.first().is_some_and(|top| self.creds.owns(&top.inode));
        if !owns_top {
            return Err(VdfsError::PermissionDenied(format!("{path} is not yours")));
        }
        let mut skipped = Vec::new();
        for visit in targets {
            if !self.creds.owns(&visit.inode) {
                tracing::warn!(path = %visit.path, "chown skipped foreign node");
                skipped.push(visit.path);
                continue;
            }
            let mut inode = visit.inode;
            inode.uid = uid;
            inode.gid = gid;
            write_inode(&self.alloc, visit.ino, &inode)?;
        }
        self.log(JournalOp::Chown, path, user)?;
        Ok(skipped)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Full paths below `path` whose name matches `pattern`, in traversal
    /// order. Unreadable directories are neither listed nor entered.
    pub fn find(&self, path: &str, pattern: &str) -> Result<Vec<String>> {
        let (ino, inode) = self.resolve(path)?;
        self.require(&inode, PERM_READ, path)?;
        let readable = |inode: &Inode| self.creds.can(inode, PERM_READ);
        let visits = self.walk(path, ino, inode, &readable)?;
        Ok(visits
            .into_iter()
            .filter(|visit| visit.depth > 0)
            .filter(|visit| !visit.inode.is_dir() || readable(&visit.inode))
            .filter(|visit| glob_match(pattern, last_name(&visit.path)))
            .map(|visit| visit.path)
            .collect())
    }

    pub fn tree(&self, path: &str) -> Result<TreeNode> {
        let (ino, inode) = self.resolve(path)?;
        let name = components(path)?.last().map_or("/", |name| *name).to_owned();
        let mut seen = HashSet::new();
        self.tree_node(name, ino, inode, &mut seen)
    }

    fn tree_node(
        &self,
        name: String,
        ino: InodeIndex,
        inode: Inode,
        seen: &mut HashSet<InodeIndex>,
    ) -> Result<TreeNode> {
        let mut children = Vec::new();
        if inode.is_dir() && seen.insert(ino) {
            for entry in dir::list(&self.alloc, &inode)? {
                let child = self.inode(entry.inode)?;
                children.push(self.tree_node(entry.name, entry.inode, child, seen)?);
            }
        }
        Ok(TreeNode {
            name,
            inode: ino,
            kind: inode.kind,
            perm: inode.perm,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::format;
    use parking_lot::Mutex;
    use std::ops::Range;
    use vdfs_block::MemoryByteDevice;
    use vdfs_inode::Credentials;
    use vdfs_types::{BLOCK_SIZE, ByteOffset, FsType};

    const USERS: &str = "1,G,root\n1,U,root,root,123\n";
    const ALICE: Credentials = Credentials {
        uid: 2,
        gid: 2,
        root: false,
    };
    const BOB: Credentials = Credentials {
        uid: 3,
        gid: 3,
        root: false,
    };

    fn device(fs_type: FsType) -> MemoryByteDevice {
        let dev = MemoryByteDevice::new(128 * 1024);
        format(&dev, 0, 128 * 1024, fs_type, 50, USERS).expect("format");
        dev
    }

    fn open(dev: &MemoryByteDevice, creds: Credentials) -> Volume<'_, MemoryByteDevice> {
        Volume::open(dev, ByteOffset(0), creds).expect("open volume")
    }

    /// Memory device whose writes fail inside the `deny` byte range.
    struct FailingWrites {
        inner: MemoryByteDevice,
        deny: Mutex<Option<Range<u64>>>,
    }

    impl ByteDevice for FailingWrites {
        fn len_bytes(&self) -> u64 {
            self.inner.len_bytes()
        }

        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read_exact_at(offset, buf)
        }

        fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            let end = offset + buf.len() as u64;
            let denied = self
                .deny
                .lock()
                .as_ref()
                .is_some_and(|deny| offset < deny.end && deny.start < end);
            if denied {
                return Err(VdfsError::Io(std::io::Error::other("injected write failure")));
            }
            self.inner.write_all_at(offset, buf)
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }

    // ── Glob tests ──────────────────────────────────────────────────────

    #[test]
    fn glob_wildcards() {
        assert!(glob_match("*.txt", "notes.txt"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(!glob_match("*.txt", "notes.TXT"));
        assert!(!glob_match("abc", "abcd"), "match is anchored");
        assert!(glob_match("f.t", "f.t"));
        assert!(!glob_match("f.t", "fxt"), "dot is literal");
    }

    // ── Create tests ────────────────────────────────────────────────────

    #[test]
    fn mkdir_twice_fails_with_exists() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        vol.mkdir("/a", false).expect("mkdir /a");
        vol.mkdir("/a/b", false).expect("mkdir /a/b");
        assert!(matches!(vol.mkdir("/a/b", false), Err(VdfsError::Exists(_))));
        assert!(matches!(vol.mkdir("/x/y", false), Err(VdfsError::NotFound(p)) if p == "/x"));
    }

    #[test]
    fn mkdir_parents_creates_exactly_missing_dirs() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        let before = vol.superblock().unwrap().inodes_count;
        vol.mkdir("/a/b/c", true).expect("mkdir -p");
        assert_eq!(vol.superblock().unwrap().inodes_count, before + 3);
        let (_, c) = vol.resolve("/a/b/c").unwrap();
        assert!(c.is_dir());
        assert_eq!(c.perm, Permissions::DEFAULT);
    }

    #[test]
    fn mkfile_then_cat_roundtrips_large_content() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        let content: Vec<u8> = (0..BLOCK_SIZE * 40).map(|i| (i % 251) as u8).collect();
        vol.mkfile("/big.bin", false, &content).expect("mkfile");
        assert_eq!(vol.cat("/big.bin").unwrap(), content);
        vol.mkfile("/ctl", false, b"a\0b\n\tc").expect("control chars");
        assert_eq!(vol.cat("/ctl").unwrap(), b"a\0b\n\tc");
        assert!(matches!(vol.cat("/"), Err(VdfsError::IsDirectory(_))));
    }

    #[test]
    fn directories_grow_past_first_block() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        vol.mkdir("/d", false).unwrap();
        for i in 0..20 {
            vol.mkfile(&format!("/d/f{i}"), false, b"x").expect("file");
        }
        let found = vol.find("/d", "f1?").unwrap();
        assert_eq!(found.len(), 10);
        assert_eq!(found[0], "/d/f10");
    }

    #[test]
    fn create_requires_write_on_parent() {
        let dev = device(FsType::Ext2);
        open(&dev, Credentials::ROOT).mkdir("/private", false).unwrap();
        let alice = open(&dev, ALICE);
        assert!(matches!(
            alice.mkfile("/private/f", false, b""),
            Err(VdfsError::PermissionDenied(_))
        ));
        alice.mkdir("/mine", false).expect("root dir is 777");
        let (_, mine) = alice.resolve("/mine").unwrap();
        assert_eq!((mine.uid, mine.gid), (2, 2));
    }

    // ── Edit / remove ───────────────────────────────────────────────────

    #[test]
    fn edit_reallocates_blocks() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        vol.mkfile("/f", false, &vec![b'a'; BLOCK_SIZE * 20]).unwrap();
        let used = vol.superblock().unwrap().blocks_count;
        vol.edit("/f", b"short").unwrap();
        assert_eq!(vol.cat("/f").unwrap(), b"short");
        // 20 data blocks plus one indirect block collapse into one block.
        assert_eq!(vol.superblock().unwrap().blocks_count, used - 20);
    }

    #[test]
    fn remove_subtree_frees_everything() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        let before = vol.superblock().unwrap();
        vol.mkdir("/a/b", true).unwrap();
        vol.mkfile("/a/b/f", false, &vec![b'z'; BLOCK_SIZE * 14]).unwrap();
        vol.mkfile("/a/g", false, b"g").unwrap();
        assert_eq!(vol.remove("/a").unwrap(), 4);
        let after = vol.superblock().unwrap();
        assert_eq!(before.free_inodes_count, after.free_inodes_count);
        assert_eq!(before.free_blocks_count, after.free_blocks_count);
        assert!(matches!(vol.resolve("/a"), Err(VdfsError::NotFound(_))));
        assert!(matches!(vol.remove("/"), Err(VdfsError::InvalidArgument(_))));
        assert!(matches!(vol.remove("/users.txt"), Err(VdfsError::InvalidArgument(_))));
    }

    #[test]
    fn remove_is_all_or_nothing() {
        let dev = device(FsType::Ext2);
        let alice = open(&dev, ALICE);
        alice.mkdir("/shared", false).unwrap();
        let bob = open(&dev, BOB);
        // 664 gives "other" read only, so bob cannot write under /shared.
        assert!(bob.mkfile("/shared/b", false, b"").is_err());
        alice.mkfile("/shared/a", false, b"").unwrap();
        open(&dev, Credentials::ROOT)
            .chmod("/shared", Permissions::FULL, false)
            .unwrap();
        bob.mkfile("/shared/b", false, b"").unwrap();
        assert!(matches!(alice.remove("/shared"), Err(VdfsError::PermissionDenied(p)) if p.contains("/shared/b")));
        assert!(alice.resolve("/shared/a").is_ok(), "nothing was freed");
    }

    // ── Rename / move / copy ────────────────────────────────────────────

    #[test]
    fn rename_collision_leaves_both() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        vol.mkdir("/a", false).unwrap();
        vol.mkdir("/b", false).unwrap();
        assert!(matches!(vol.rename("/a", "b"), Err(VdfsError::Exists(_))));
        assert!(vol.resolve("/a").is_ok() && vol.resolve("/b").is_ok());
        vol.rename("/a", "c").unwrap();
        assert!(vol.resolve("/c").is_ok());
        assert!(matches!(vol.rename("/zz", "y"), Err(VdfsError::NotFound(_))));
    }

    #[test]
    fn move_repoints_parent_and_rejects_cycles() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        vol.mkdir("/src/inner", true).unwrap();
        vol.mkdir("/dst", false).unwrap();
        vol.mv("/src", "/dst").unwrap();
        let (dst_ino, _) = vol.resolve("/dst").unwrap();
        let (_, moved) = vol.resolve("/dst/src").unwrap();
        assert_eq!(dir::parent_of(vol.allocator(), &moved).unwrap(), Some(dst_ino));
        assert!(vol.resolve("/dst/src/inner").is_ok());
        assert!(matches!(
            vol.mv("/dst", "/dst/src/inner"),
            Err(VdfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn move_does_not_grow_destination() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        vol.mkdir("/full", false).unwrap();
        vol.mkfile("/full/a", false, b"").unwrap();
        vol.mkfile("/full/b", false, b"").unwrap();
        vol.mkfile("/m", false, b"m").unwrap();
        assert!(matches!(vol.mv("/m", "/full"), Err(VdfsError::NoSpace)));
        assert!(vol.resolve("/m").is_ok());
    }

    #[test]
    fn move_unlinks_destination_when_source_write_fails() {
        let dev = FailingWrites {
            inner: device(FsType::Ext2),
            deny: Mutex::new(None),
        };
        let vol = Volume::open(&dev, ByteOffset(0), Credentials::ROOT).expect("open volume");
        vol.mkdir("/src", false).unwrap();
        vol.mkfile("/src/f", false, b"data").unwrap();
        vol.mkdir("/dst", false).unwrap();

        let (_, src) = vol.resolve("/src").unwrap();
        let entry = dir::list(&vol.alloc, &src)
            .unwrap()
            .into_iter()
            .find(|entry| entry.name == "f")
            .unwrap();
        let sb = vol.superblock().unwrap();
        let at = u64::try_from(sb.block_start).unwrap() + u64::from(entry.block.0) * BLOCK_SIZE as u64;
        *dev.deny.lock() = Some(at..at + BLOCK_SIZE as u64);

        assert!(matches!(vol.mv("/src/f", "/dst"), Err(VdfsError::Io(_))));
        *dev.deny.lock() = None;
        assert!(matches!(vol.resolve("/dst/f"), Err(VdfsError::NotFound(_))));
        assert_eq!(vol.cat("/src/f").unwrap(), b"data");
        let (_, dst) = vol.resolve("/dst").unwrap();
        assert!(dir::list(&vol.alloc, &dst).unwrap().is_empty());
    }

    #[test]
    fn copy_skips_unreadable_sources() {
        let dev = device(FsType::Ext2);
        let root = open(&dev, Credentials::ROOT);
        root.mkdir("/tree/sub", true).unwrap();
        root.mkfile("/tree/sub/data", false, b"payload").unwrap();
        root.mkfile("/tree/secret", false, b"s").unwrap();
        root.chmod("/tree/secret", Permissions::parse("600").unwrap(), false).unwrap();
        root.mkdir("/out", false).unwrap();
        root.chmod("/out", Permissions::FULL, false).unwrap();

        let alice = open(&dev, ALICE);
        let report = alice.copy("/tree", "/out").expect("copy");
        assert_eq!(report.skipped, ["/tree/secret"]);
        assert_eq!(report.copied, ["/out/tree", "/out/tree/sub", "/out/tree/sub/data"]);
        assert_eq!(alice.cat("/out/tree/sub/data").unwrap(), b"payload");
        let (_, copy) = alice.resolve("/out/tree/sub/data").unwrap();
        assert_eq!((copy.uid, copy.perm), (2, Permissions::DEFAULT));
        assert!(matches!(root.copy("/tree", "/tree/sub"), Err(VdfsError::InvalidArgument(_))));
    }

    // ── chmod / chown / find ────────────────────────────────────────────

    #[test]
    fn chmod_is_root_only() {
        let dev = device(FsType::Ext2);
        let alice = open(&dev, ALICE);
        alice.mkdir("/a", false).unwrap();
        assert!(matches!(
            alice.chmod("/a", Permissions::FULL, false),
            Err(VdfsError::PermissionDenied(_))
        ));
        let root = open(&dev, Credentials::ROOT);
        root.mkfile("/a/f", false, b"").unwrap();
        assert_eq!(root.chmod("/a", Permissions::parse("700").unwrap(), true).unwrap(), 2);
        let (_, f) = root.resolve("/a/f").unwrap();
        assert_eq!(f.perm.to_string(), "700");
    }

    #[test]
    fn recursive_chown_skips_foreign_nodes() {
        let dev = device(FsType::Ext2);
        let alice = open(&dev, ALICE);
        alice.mkdir("/a", false).unwrap();
        open(&dev, Credentials::ROOT).mkfile("/a/rootfile", false, b"").unwrap();
        alice.mkfile("/a/mine", false, b"").unwrap();
        let skipped = alice.chown("/a", "bob", 3, 3, true).unwrap();
        assert_eq!(skipped, ["/a/rootfile"]);
        let (_, mine) = alice.resolve("/a/mine").unwrap();
        assert_eq!((mine.uid, mine.gid), (3, 3));
        assert!(matches!(
            open(&dev, ALICE).chown("/a", "alice", 2, 2, false),
            Err(VdfsError::PermissionDenied(_))
        ));
    }

    #[test]
    fn find_walks_in_order_and_skips_unreadable() {
        let dev = device(FsType::Ext2);
        let root = open(&dev, Credentials::ROOT);
        root.mkdir("/docs/old", true).unwrap();
        root.mkfile("/docs/a.txt", false, b"").unwrap();
        root.mkfile("/docs/old/b.txt", false, b"").unwrap();
        root.mkdir("/hidden", false).unwrap();
        root.mkfile("/hidden/c.txt", false, b"").unwrap();
        root.chmod("/hidden", Permissions::parse("700").unwrap(), false).unwrap();

        assert_eq!(
            root.find("/", "*.txt").unwrap(),
            ["/users.txt", "/docs/old/b.txt", "/docs/a.txt", "/hidden/c.txt"]
        );
        let alice = open(&dev, ALICE);
        assert_eq!(
            alice.find("/", "*.txt").unwrap(),
            ["/users.txt", "/docs/old/b.txt", "/docs/a.txt"]
        );
        assert_eq!(alice.find("/docs", "old").unwrap(), ["/docs/old"]);
    }

    #[test]
    fn tree_mirrors_layout() {
        let dev = device(FsType::Ext2);
        let vol = open(&dev, Credentials::ROOT);
        vol.mkdir("/a", false).unwrap();
        vol.mkfile("/a/f", false, b"12345").unwrap();
        let tree = vol.tree("/").unwrap();
        assert_eq!(tree.name, "/");
        let names: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["users.txt", "a"]);
        assert_eq!(tree.children[1].children[0].size, 5);
        assert_eq!(tree.children[1].children[0].kind, NodeKind::File);
    }

    #[test]
    fn ext3_mutations_are_journaled() {
        let dev = device(FsType::Ext3);
        let vol = open(&dev, Credentials::ROOT);
        vol.mkdir("/x", false).unwrap();
        vol.mkfile("/x/f.txt", false, b"hi").unwrap();
        vol.rename("/x/f.txt", "g.txt").unwrap();
        let ops: Vec<String> = vol
            .journal()
            .unwrap()
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| format!("{} {}", e.op, e.path))
            .collect();
        assert_eq!(
            ops,
            ["mkdir /", "mkfile /users.txt", "mkdir /x", "mkfile /x/f.txt", "rename /x/f.txt"]
        );
    }
}
