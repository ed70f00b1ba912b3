#![forbid(unsafe_code)]
//! VDFS engine: disks, partitions, mounts, sessions and the filesystem tree.
//!
//! [`Vdfs`] owns the mount table and the (single) user session. Every call
//! opens the disk image for its own duration, so the engine holds no file
//! handles between operations.

mod mount;
mod recovery;
mod report;
mod tree;
mod users;
mod volume;

pub use mount::{LetterAllocator, MountEntry, MountTable};
pub use recovery::RecoveryReport;
pub use report::{BitmapReport, BlockContent, BlockReport, InodeReport};
pub use tree::{CopyReport, TreeNode, glob_match};
pub use users::{MAX_FIELD_LEN, Session, UserRecord, UserTable, default_users};
pub use vdfs_alloc::BitmapKind;
pub use vdfs_disk::{DeleteMode, PartitionInfo, PartitionSpec};
pub use vdfs_error::{Result, VdfsError};
pub use vdfs_inode::{Credentials, MAX_FILE_SIZE};
pub use vdfs_ondisk::{Inode, JournalEntry, Mbr, SuperBlock};
pub use vdfs_types::{Fit, FsType, NodeKind, PartitionKind, Permissions, SizeUnit};
pub use volume::{Volume, format};

use serde::{Deserialize, Serialize};
use std::path::Path;
use vdfs_alloc::Allocator;
use vdfs_block::{ByteDevice, FileByteDevice};
use vdfs_journal::JournalOp;
use vdfs_ondisk::Partition;
use vdfs_types::{ByteOffset, PARTITION_ID_LEN, USERS_FILE_PATH, unix_now};

// ── Configuration ───────────────────────────────────────────────────────────

/// Engine settings, loadable from JSON. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Journal slots reserved by `mkfs -fs=3fs`.
    pub journal_entries: u32,
    /// Leading digits of every mount id.
    pub mount_id_prefix: String,
    pub default_file_perm: String,
    pub default_dir_perm: String,
    /// Password of `root` written by `mkfs` and `recovery`.
    pub root_password: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_entries: 50,
            mount_id_prefix: "89".to_owned(),
            default_file_perm: "664".to_owned(),
            default_dir_perm: "664".to_owned(),
            root_password: "123".to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| VdfsError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against the on-disk limits.
    pub fn validate(&self) -> Result<()> {
        self.perms()?;
        // Prefix, one slot digit and one letter must fit the MBR id field.
        if self.mount_id_prefix.len() + 2 > PARTITION_ID_LEN || !self.mount_id_prefix.is_ascii() {
            return Err(VdfsError::InvalidArgument(format!(
                "mount_id_prefix {:?} must be at most {} ASCII characters",
                self.mount_id_prefix,
                PARTITION_ID_LEN - 2
            )));
        }
        if self.journal_entries == 0 {
            return Err(VdfsError::InvalidArgument("journal_entries must be positive".to_owned()));
        }
        users::validate_field(&self.root_password, "root password")
    }

    fn perms(&self) -> Result<(Permissions, Permissions)> {
        let parse = |text: &str| Permissions::parse(text).map_err(|e| VdfsError::InvalidArgument(e.to_string()));
        Ok((parse(&self.default_file_perm)?, parse(&self.default_dir_perm)?))
    }
}

/// Options for `mkfs`. Only full formatting exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkfsOptions {
    pub fs_type: FsType,
}

#[allow(clippy::derivable_impls)]
impl Default for MkfsOptions {
    fn default() -> Self {
        Self { fs_type: FsType::Ext2 }
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Content written by `mkfile -size=N` without `-cont`.
#[must_use]
pub fn digit_content(size: usize) -> Vec<u8> {
    b"0123456789".iter().copied().cycle().take(size).collect()
}

fn partition_range(part: &Partition) -> Result<(u64, u64)> {
    let start = u64::try_from(part.start)
        .map_err(|_| VdfsError::Format(format!("partition {} has no start", part.name)))?;
    let size = u64::try_from(part.size)
        .map_err(|_| VdfsError::Format(format!("partition {} has no size", part.name)))?;
    Ok((start, size))
}

/// Stamp mount or unmount time on a formatted partition. Unformatted
/// partitions are left alone.
fn stamp_superblock(dev: &FileByteDevice, part: &Partition, mounting: bool) -> Result<()> {
    let (start, _) = partition_range(part)?;
    let alloc = Allocator::new(dev, ByteOffset(start));
    let Ok(mut sb) = alloc.superblock() else {
        tracing::debug!(partition = %part.name, "partition not formatted, superblock untouched");
        return Ok(());
    };
    if mounting {
        sb.mtime = unix_now();
        sb.mnt_count = sb.mnt_count.saturating_add(1);
    } else {
        sb.umtime = unix_now();
    }
    alloc.write_superblock(&sb)
}

#[derive(Debug)]
pub struct Vdfs {
    config: EngineConfig,
    file_perm: Permissions,
    dir_perm: Permissions,
    mounts: MountTable,
    session: Option<Session>,
}

impl Vdfs {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (file_perm, dir_perm) = config.perms()?;
        let mounts = MountTable::new(config.mount_id_prefix.clone());
        Ok(Self {
            config,
            file_perm,
            dir_perm,
            mounts,
            session: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn users_content(&self) -> String {
        default_users(&self.config.root_password)
    }

    /// Open the disk behind mount `id` and return it with the partition's
    /// current MBR record.
    fn open_mount(&self, id: &str) -> Result<(FileByteDevice, Partition)> {
        let entry = self.mounts.get(id)?;
        let dev = FileByteDevice::open(&entry.disk)?;
        let mbr = vdfs_disk::read_mbr(&dev)?;
        let part = mbr
            .partitions
            .get(entry.slot)
            .filter(|p| p.name_matches(&entry.partition))
            .cloned()
            .ok_or_else(|| VdfsError::NotFound(format!("partition {} on {}", entry.partition, entry.disk.display())))?;
        Ok((dev, part))
    }

    /// Run `f` against the filesystem of mount `id` as `creds`.
    fn with_volume<T>(
        &self,
        id: &str,
        creds: Credentials,
        f: impl FnOnce(&Volume<'_, FileByteDevice>) -> Result<T>,
    ) -> Result<T> {
        let (dev, part) = self.open_mount(id)?;
        let (start, _) = partition_range(&part)?;
        let vol = Volume::open(&dev, ByteOffset(start), creds)?.with_default_perms(self.file_perm, self.dir_perm);
        let out = f(&vol)?;
        dev.sync()?;
        Ok(out)
    }

    /// Run `f` on the session's mount as the session user.
    fn with_session<T>(&self, f: impl FnOnce(&Volume<'_, FileByteDevice>, &Session) -> Result<T>) -> Result<T> {
        let session = self.session.as_ref().ok_or(VdfsError::NoActiveSession)?;
        self.with_volume(&session.mount_id, session.credentials(), |vol| f(vol, session))
    }

    /// Load, change and store the user table. Root only.
    fn with_users<T>(&self, op: JournalOp, payload: &str, f: impl FnOnce(&mut UserTable) -> Result<T>) -> Result<T> {
        self.with_session(|vol, session| {
            if !session.is_root() {
                return Err(VdfsError::PermissionDenied(format!("{op} requires root")));
            }
            let mut table = users::load(vol)?;
            let out = f(&mut table)?;
            users::store(vol, &table)?;
            vol.log(op, USERS_FILE_PATH, payload)?;
            Ok(out)
        })
    }

    // ── Disks ───────────────────────────────────────────────────────────────

    pub fn mkdisk(&self, path: &Path, size: i64, unit: SizeUnit, fit: Fit) -> Result<Mbr> {
        vdfs_disk::create_disk(path, size, unit, fit)
    }

    pub fn rmdisk(&self, path: &Path) -> Result<()> {
        if self.mounts.has_disk(path) {
            return Err(VdfsError::InvalidArgument(format!(
                "{} has mounted partitions",
                path.display()
            )));
        }
        vdfs_disk::remove_disk(path)
    }

    // ── Partitions ──────────────────────────────────────────────────────────

    pub fn fdisk_create(&self, path: &Path, spec: &PartitionSpec) -> Result<PartitionInfo> {
        let dev = FileByteDevice::open(path)?;
        let info = vdfs_disk::create_partition(&dev, spec)?;
        dev.sync()?;
        Ok(info)
    }

    pub fn fdisk_delete(&self, path: &Path, name: &str, mode: DeleteMode) -> Result<()> {
        if let Some(entry) = self.mounts.find(path, name) {
            return Err(VdfsError::InvalidArgument(format!(
                "partition {name} is mounted as {}",
                entry.id
            )));
        }
        let dev = FileByteDevice::open(path)?;
        vdfs_disk::delete_partition(&dev, name, mode)?;
        dev.sync()
    }

    /// Grow (`amount > 0`) or shrink (`amount < 0`) a partition by
    /// `amount` units.
    pub fn fdisk_resize(&self, path: &Path, name: &str, amount: i64, unit: SizeUnit) -> Result<PartitionInfo> {
        let delta = amount
            .checked_mul(unit.multiplier())
            .ok_or_else(|| VdfsError::InvalidArgument(format!("resize amount {amount} overflows")))?;
        let dev = FileByteDevice::open(path)?;
        let info = vdfs_disk::resize_partition(&dev, name, delta)?;
        dev.sync()?;
        Ok(info)
    }

    pub fn list_partitions(&self, path: &Path) -> Result<Vec<PartitionInfo>> {
        let dev = FileByteDevice::open(path)?;
        vdfs_disk::list_partitions(&dev)
    }

    // ── Mounting ────────────────────────────────────────────────────────────

    pub fn mount(&mut self, path: &Path, name: &str) -> Result<MountEntry> {
        let dev = FileByteDevice::open(path)?;
        let mbr = vdfs_disk::read_mbr(&dev)?;
        let Some((slot, part)) = mbr.used().find(|(_, p)| p.name_matches(name)) else {
            let logical = vdfs_disk::list_partitions(&dev)?
                .iter()
                .any(|p| p.kind == PartitionKind::Logical && p.name.eq_ignore_ascii_case(name));
            return Err(if logical {
                VdfsError::InvalidArgument(format!("logical partition {name} cannot be mounted"))
            } else {
                VdfsError::NotFound(format!("partition {name} on {}", path.display()))
            });
        };
        if part.kind == Some(PartitionKind::Extended) {
            return Err(VdfsError::InvalidArgument(format!(
                "extended partition {name} cannot be mounted"
            )));
        }
        if part.mounted && self.mounts.find(path, name).is_none() {
            tracing::warn!(partition = %part.name, id = %part.id, "stale mount flag in MBR");
        }
        let part_name = part.name.clone();
        let entry = self.mounts.insert(path, &part_name, slot)?;
        let part = match vdfs_disk::set_mount_state(&dev, slot, Some(&entry.id)) {
            Ok(part) => part,
            Err(err) => {
                self.mounts.remove(&entry.id).ok();
                return Err(err);
            }
        };
        stamp_superblock(&dev, &part, true)?;
        dev.sync()?;
        tracing::info!(id = %entry.id, disk = %path.display(), partition = %part_name, "partition mounted");
        Ok(entry)
    }

    /// Unmount `id`. A session bound to it is closed.
    pub fn unmount(&mut self, id: &str) -> Result<MountEntry> {
        let entry = self.mounts.get(id)?.clone();
        let dev = FileByteDevice::open(&entry.disk)?;
        let part = vdfs_disk::set_mount_state(&dev, entry.slot, None)?;
        stamp_superblock(&dev, &part, false)?;
        dev.sync()?;
        self.mounts.remove(&entry.id)?;
        if self.session.as_ref().is_some_and(|s| s.mount_id == entry.id) {
            tracing::info!(id = %entry.id, "session closed by unmount");
            self.session = None;
        }
        tracing::info!(id = %entry.id, "partition unmounted");
        Ok(entry)
    }

    #[must_use]
    pub fn mounted(&self) -> Vec<MountEntry> {
        self.mounts.list()
    }

    // ── Formatting ──────────────────────────────────────────────────────────

    pub fn mkfs(&self, id: &str, options: MkfsOptions) -> Result<SuperBlock> {
        let (dev, part) = self.open_mount(id)?;
        let (start, size) = partition_range(&part)?;
        let sb = format(
            &dev,
            start,
            size,
            options.fs_type,
            self.config.journal_entries,
            &self.users_content(),
        )?;
        dev.sync()?;
        Ok(sb)
    }

    // ── Session ─────────────────────────────────────────────────────────────

    pub fn login(&mut self, user: &str, password: &str, id: &str) -> Result<&Session> {
        if let Some(active) = &self.session {
            return Err(VdfsError::InvalidArgument(format!(
                "{} is already logged in; logout first",
                active.user
            )));
        }
        let mount_id = self.mounts.get(id)?.id.clone();
        let (uid, gid, group) =
            self.with_volume(&mount_id, Credentials::ROOT, |vol| users::load(vol)?.authenticate(user, password))?;
        tracing::info!(user, uid, gid, id = %mount_id, "logged in");
        Ok(&*self.session.insert(Session {
            user: user.to_owned(),
            uid,
            gid,
            group,
            mount_id,
        }))
    }

    pub fn logout(&mut self) -> Result<Session> {
        let session = self.session.take().ok_or(VdfsError::NoActiveSession)?;
        tracing::info!(user = %session.user, "logged out");
        Ok(session)
    }

    // ── Users and groups ────────────────────────────────────────────────────

    pub fn mkgrp(&self, name: &str) -> Result<i32> {
        self.with_users(JournalOp::Mkgrp, name, |table| table.add_group(name))
    }

    /// Remove a group and soft-delete its members. Returns the number of
    /// members affected.
    pub fn rmgrp(&self, name: &str) -> Result<usize> {
        self.with_users(JournalOp::Rmgrp, name, |table| table.remove_group(name))
    }

    pub fn mkusr(&self, user: &str, password: &str, group: &str) -> Result<i32> {
        let payload = format!("{user},{group}");
        self.with_users(JournalOp::Mkusr, &payload, |table| table.add_user(user, password, group))
    }

    pub fn rmusr(&self, user: &str) -> Result<()> {
        self.with_users(JournalOp::Rmusr, user, |table| table.remove_user(user))
    }

    pub fn chgrp(&self, user: &str, group: &str) -> Result<()> {
        let payload = format!("{user},{group}");
        self.with_users(JournalOp::Chgrp, &payload, |table| table.change_group(user, group))
    }

    /// Every record of `/users.txt`, deleted ones included.
    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.with_session(|vol, _| Ok(users::load(vol)?.records().to_vec()))
    }

    // ── Tree ────────────────────────────────────────────────────────────────

    pub fn mkdir(&self, path: &str, parents: bool) -> Result<()> {
        self.with_session(|vol, _| vol.mkdir(path, parents).map(|_| ()))
    }

    /// Create a file holding `content`, or `size` digits when no content
    /// is given.
    pub fn mkfile(&self, path: &str, parents: bool, size: Option<i64>, content: Option<&str>) -> Result<()> {
        let size = match size {
            Some(n) => Some(
                usize::try_from(n).map_err(|_| VdfsError::InvalidArgument(format!("size must not be negative, got {n}")))?,
            ),
            None => None,
        };
        let bytes = match (content, size) {
            (Some(text), _) => text.as_bytes().to_vec(),
            (None, Some(n)) => digit_content(n),
            (None, None) => Vec::new(),
        };
        self.with_session(|vol, _| vol.mkfile(path, parents, &bytes).map(|_| ()))
    }

    /// Contents of `paths` joined by `\n`.
    pub fn cat(&self, paths: &[&str]) -> Result<Vec<u8>> {
        self.with_session(|vol, _| {
            let mut out = Vec::new();
            for (i, path) in paths.iter().enumerate() {
                if i > 0 {
                    out.push(b'\n');
                }
                out.extend(vol.cat(path)?);
            }
            Ok(out)
        })
    }

    pub fn edit(&self, path: &str, content: &str) -> Result<()> {
        self.with_session(|vol, _| vol.edit(path, content.as_bytes()))
    }

    /// Remove a file or a whole directory subtree. Returns the number of
    /// inodes freed.
    pub fn remove(&self, path: &str) -> Result<usize> {
        self.with_session(|vol, _| vol.remove(path))
    }

    pub fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        self.with_session(|vol, _| vol.rename(path, new_name))
    }

    pub fn mv(&self, path: &str, dest: &str) -> Result<()> {
        self.with_session(|vol, _| vol.mv(path, dest))
    }

    pub fn copy(&self, path: &str, dest: &str) -> Result<CopyReport> {
        self.with_session(|vol, _| vol.copy(path, dest))
    }

    pub fn chmod(&self, path: &str, ugo: &str, recursive: bool) -> Result<usize> {
        let perm = Permissions::parse(ugo).map_err(|e| VdfsError::InvalidArgument(format!("ugo {ugo:?}: {e}")))?;
        self.with_session(|vol, _| vol.chmod(path, perm, recursive))
    }

    /// Hand `path` to `user`. Returns the paths skipped because the
    /// session user does not own them.
    pub fn chown(&self, path: &str, user: &str, recursive: bool) -> Result<Vec<String>> {
        self.with_session(|vol, _| {
            let (uid, gid, _) = users::load(vol)?.identity(user)?;
            vol.chown(path, user, uid, gid, recursive)
        })
    }

    pub fn find(&self, path: &str, pattern: &str) -> Result<Vec<String>> {
        self.with_session(|vol, _| vol.find(path, pattern))
    }

    pub fn tree(&self, path: &str) -> Result<TreeNode> {
        self.with_session(|vol, _| vol.tree(path))
    }

    // ── Journal ─────────────────────────────────────────────────────────────

    pub fn journaling(&self, id: &str) -> Result<Vec<JournalEntry>> {
        self.with_volume(id, Credentials::ROOT, recovery::journaling)
    }

    pub fn loss(&self, id: &str) -> Result<()> {
        self.with_volume(id, Credentials::ROOT, recovery::loss)
    }

    pub fn recovery(&self, id: &str) -> Result<RecoveryReport> {
        let users_content = self.users_content();
        self.with_volume(id, Credentials::ROOT, |vol| recovery::recover(vol, &users_content))
    }

    // ── Dumps ───────────────────────────────────────────────────────────────

    pub fn superblock(&self, id: &str) -> Result<SuperBlock> {
        self.with_volume(id, Credentials::ROOT, |vol| vol.superblock())
    }

    pub fn bitmap_dump(&self, id: &str, kind: BitmapKind) -> Result<BitmapReport> {
        self.with_volume(id, Credentials::ROOT, |vol| report::bitmap(vol, kind))
    }

    pub fn inode_dump(&self, id: &str) -> Result<Vec<InodeReport>> {
        self.with_volume(id, Credentials::ROOT, report::inodes)
    }

    pub fn block_dump(&self, id: &str) -> Result<Vec<BlockReport>> {
        self.with_volume(id, Credentials::ROOT, report::blocks)
    }
}
