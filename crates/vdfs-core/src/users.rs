//! Groups and users stored in `/users.txt`.
//!
//! Each line is `id,G,name` or `id,U,group,name,password`. Removal is soft:
//! the record keeps its place with id `0` and no longer counts as present.

use serde::Serialize;
use vdfs_block::ByteDevice;
use vdfs_error::{Result, VdfsError};
use vdfs_inode::{Credentials, read_data, read_inode, write_data, write_inode};
use vdfs_types::{InodeIndex, ROOT_GROUP, ROOT_USER};

use crate::volume::{Volume, now};

/// Longest user, group or password accepted.
pub const MAX_FIELD_LEN: usize = 10;

/// Initial content of `/users.txt` on a fresh filesystem.
#[must_use]
pub fn default_users(root_password: &str) -> String {
    format!("1,G,{ROOT_GROUP}\n1,U,{ROOT_GROUP},{ROOT_USER},{root_password}\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UserRecord {
    Group {
        id: i32,
        name: String,
    },
    User {
        id: i32,
        group: String,
        name: String,
        #[serde(skip_serializing)]
        password: String,
    },
}

impl UserRecord {
    #[must_use]
    pub fn id(&self) -> i32 {
        match self {
            Self::Group { id, .. } | Self::User { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.id() != 0
    }

    fn set_deleted(&mut self) {
        match self {
            Self::Group { id, .. } | Self::User { id, .. } => *id = 0,
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Group { id, name } => format!("{id},G,{name}"),
            Self::User {
                id,
                group,
                name,
                password,
            } => format!("{id},U,{group},{name},{password}"),
        }
    }
}

/// An authenticated user bound to one mounted partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user: String,
    pub uid: i32,
    pub gid: i32,
    pub group: String,
    pub mount_id: String,
}

impl Session {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.user == ROOT_USER
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            uid: self.uid,
            gid: self.gid,
            root: self.is_root(),
        }
    }
}

pub(crate) fn validate_field(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(VdfsError::InvalidArgument(format!("{what} cannot be empty")));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(VdfsError::InvalidArgument(format!(
            "{what} {value:?} exceeds {MAX_FIELD_LEN} bytes"
        )));
    }
    if value.contains([',', '\n', '\r']) {
        return Err(VdfsError::InvalidArgument(format!(
            "{what} {value:?} contains a separator"
        )));
    }
    Ok(())
}

/// Parsed content of `/users.txt`, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserTable {
    records: Vec<UserRecord>,
}

impl UserTable {
    /// Parse the file text. Malformed lines are dropped with a warning.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut records = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let Ok(id) = fields[0].parse::<i32>() else {
                tracing::warn!(line, "users file line without numeric id");
                continue;
            };
            match fields.as_slice() {
                [_, "G", name] => records.push(UserRecord::Group {
                    id,
                    name: (*name).to_owned(),
                }),
                [_, "U", group, name, password] => records.push(UserRecord::User {
                    id,
                    group: (*group).to_owned(),
                    name: (*name).to_owned(),
                    password: (*password).to_owned(),
                }),
                _ => tracing::warn!(line, "malformed users file line"),
            }
        }
        Self { records }
    }

    /// Active groups, each followed by its active members, then any
    /// stray or deleted records.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut written = vec![false; self.records.len()];
        for (gi, group) in self.records.iter().enumerate() {
            let UserRecord::Group { name: gname, .. } = group else {
                continue;
            };
            if !group.is_active() {
                continue;
            }
            written[gi] = true;
            out.push_str(&group.render());
            out.push('\n');
            for (ui, user) in self.records.iter().enumerate() {
                let member = matches!(user, UserRecord::User { group, .. } if group == gname);
                if member && user.is_active() && !written[ui] {
                    written[ui] = true;
                    out.push_str(&user.render());
                    out.push('\n');
                }
            }
        }
        let (active, deleted): (Vec<_>, Vec<_>) = self
            .records
            .iter()
            .zip(&written)
            .filter(|(_, done)| !**done)
            .map(|(record, _)| record)
            .partition(|record| record.is_active());
        for record in active.into_iter().chain(deleted) {
            out.push_str(&record.render());
            out.push('\n');
        }
        out
    }

    #[must_use]
    pub fn records(&self) -> &[UserRecord] {
        &self.records
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&UserRecord> {
        self.records.iter().find(|record| {
            matches!(record, UserRecord::Group { name: n, .. } if n == name) && record.is_active()
        })
    }

    #[must_use]
    pub fn user(&self, name: &str) -> Option<&UserRecord> {
        self.records.iter().find(|record| {
            matches!(record, UserRecord::User { name: n, .. } if n == name) && record.is_active()
        })
    }

    fn user_mut(&mut self, name: &str) -> Option<&mut UserRecord> {
        self.records.iter_mut().find(|record| {
            matches!(record, UserRecord::User { name: n, .. } if n == name) && record.is_active()
        })
    }

    fn next_id(&self, groups: bool) -> i32 {
        self.records
            .iter()
            .filter(|record| matches!(record, UserRecord::Group { .. }) == groups)
            .map(UserRecord::id)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// `(uid, gid, group)` of an active user.
    pub fn identity(&self, name: &str) -> Result<(i32, i32, String)> {
        let Some(UserRecord::User { id, group, .. }) = self.user(name) else {
            return Err(VdfsError::NotFound(format!("user {name}")));
        };
        let gid = self.group(group).map_or(0, UserRecord::id);
        Ok((*id, gid, group.clone()))
    }

    /// Check a password. Unknown users and wrong passwords look the same.
    pub fn authenticate(&self, name: &str, password: &str) -> Result<(i32, i32, String)> {
        match self.user(name) {
            Some(UserRecord::User { password: stored, .. }) if stored == password => {
                self.identity(name)
            }
            _ => Err(VdfsError::PermissionDenied(format!(
                "invalid credentials for {name}"
            ))),
        }
    }

    pub fn add_group(&mut self, name: &str) -> Result<i32> {
        validate_field(name, "group name")?;
        if self.group(name).is_some() {
            return Err(VdfsError::Exists(format!("group {name}")));
        }
        let id = self.next_id(true);
        self.records.push(UserRecord::Group {
            id,
            name: name.to_owned(),
        });
        Ok(id)
    }

    /// Soft-delete a group and every member. Returns the members removed.
    pub fn remove_group(&mut self, name: &str) -> Result<usize> {
        if name == ROOT_GROUP {
            return Err(VdfsError::InvalidArgument("the root group is permanent".to_owned()));
        }
        if self.group(name).is_none() {
            return Err(VdfsError::NotFound(format!("group {name}")));
        }
        let mut members = 0;
        for record in &mut self.records {
            let (hit, member) = match &*record {
                UserRecord::Group { name: n, .. } => (n == name, false),
                UserRecord::User { group, .. } => (group == name, group == name),
            };
            if hit {
                members += usize::from(member && record.is_active());
                record.set_deleted();
            }
        }
        Ok(members)
    }

    pub fn add_user(&mut self, name: &str, password: &str, group: &str) -> Result<i32> {
        validate_field(name, "user name")?;
        validate_field(password, "password")?;
        validate_field(group, "group name")?;
        if self.group(group).is_none() {
            return Err(VdfsError::NotFound(format!("group {group}")));
        }
        if self.user(name).is_some() {
            return Err(VdfsError::Exists(format!("user {name}")));
        }
        let id = self.next_id(false);
        self.records.push(UserRecord::User {
            id,
            group: group.to_owned(),
            name: name.to_owned(),
            password: password.to_owned(),
        });
        Ok(id)
    }

    pub fn remove_user(&mut self, name: &str) -> Result<()> {
        if name == ROOT_USER {
            return Err(VdfsError::InvalidArgument("the root user is permanent".to_owned()));
        }
        let record = self
            .user_mut(name)
            .ok_or_else(|| VdfsError::NotFound(format!("user {name}")))?;
        record.set_deleted();
        Ok(())
    }

    pub fn change_group(&mut self, name: &str, new_group: &str) -> Result<()> {
        if self.group(new_group).is_none() {
            return Err(VdfsError::NotFound(format!("group {new_group}")));
        }
        let Some(UserRecord::User { group, .. }) = self.user_mut(name) else {
            return Err(VdfsError::NotFound(format!("user {name}")));
        };
        new_group.clone_into(group);
        Ok(())
    }
}

// ── Storage ─────────────────────────────────────────────────────────────────

pub(crate) fn load<D: ByteDevice + ?Sized>(vol: &Volume<'_, D>) -> Result<UserTable> {
    let inode = read_inode(&vol.alloc, InodeIndex::USERS)?;
    let bytes = read_data(&vol.alloc, &inode)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(UserTable::parse(text.trim_end_matches('\0')))
}

pub(crate) fn store<D: ByteDevice + ?Sized>(vol: &Volume<'_, D>, table: &UserTable) -> Result<()> {
    let mut inode = read_inode(&vol.alloc, InodeIndex::USERS)?;
    write_data(&vol.alloc, &mut inode, table.render().as_bytes(), now())?;
    write_inode(&vol.alloc, InodeIndex::USERS, &inode)
}
