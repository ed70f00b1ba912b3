//! In-memory table of mounted partitions.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vdfs_error::{Result, VdfsError};

/// Hands out one stable letter `A..=Z` per disk path.
#[derive(Debug, Clone, Default)]
pub struct LetterAllocator {
    assigned: BTreeMap<PathBuf, char>,
}

impl LetterAllocator {
    /// Letter of `disk`, assigning the next unused one on first sight.
    pub fn letter_for(&mut self, disk: &Path) -> Result<char> {
        if let Some(letter) = self.assigned.get(disk) {
            return Ok(*letter);
        }
        let next = u8::try_from(self.assigned.len())
            .ok()
            .and_then(|n| b'A'.checked_add(n))
            .filter(u8::is_ascii_uppercase)
            .ok_or(VdfsError::NoSpace)?;
        let letter = char::from(next);
        self.assigned.insert(disk.to_path_buf(), letter);
        Ok(letter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountEntry {
    pub id: String,
    pub disk: PathBuf,
    pub partition: String,
    /// MBR slot of the partition.
    pub slot: usize,
}

#[derive(Debug, Clone)]
pub struct MountTable {
    prefix: String,
    letters: LetterAllocator,
    entries: Vec<MountEntry>,
}

impl MountTable {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            letters: LetterAllocator::default(),
            entries: Vec::new(),
        }
    }

    /// Key used for letters and duplicate checks.
    fn disk_key(disk: &Path) -> PathBuf {
        std::fs::canonicalize(disk).unwrap_or_else(|_| disk.to_path_buf())
    }

    /// Register a mount and return its id. The caller has already checked
    /// that the partition exists and is primary.
    pub fn insert(&mut self, disk: &Path, partition: &str, slot: usize) -> Result<MountEntry> {
        let key = Self::disk_key(disk);
        if let Some(existing) = self
            .entries
            .iter()
            .find(|e| e.disk == key && e.partition.eq_ignore_ascii_case(partition))
        {
            return Err(VdfsError::Exists(format!(
                "{partition} already mounted as {}",
                existing.id
            )));
        }
        let letter = self.letters.letter_for(&key)?;
        let entry = MountEntry {
            id: format!("{}{}{letter}", self.prefix, slot + 1),
            disk: key,
            partition: partition.to_owned(),
            slot,
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn remove(&mut self, id: &str) -> Result<MountEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| VdfsError::NotMounted(id.to_owned()))?;
        Ok(self.entries.remove(pos))
    }

    pub fn get(&self, id: &str) -> Result<&MountEntry> {
        self.entries
            .iter()
            .find(|e| e.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| VdfsError::NotMounted(id.to_owned()))
    }

    /// Whether any partition of `disk` is mounted.
    #[must_use]
    pub fn has_disk(&self, disk: &Path) -> bool {
        let key = Self::disk_key(disk);
        self.entries.iter().any(|e| e.disk == key)
    }

    #[must_use]
    pub fn find(&self, disk: &Path, partition: &str) -> Option<&MountEntry> {
        let key = Self::disk_key(disk);
        self.entries
            .iter()
            .find(|e| e.disk == key && e.partition.eq_ignore_ascii_case(partition))
    }

    /// Entries sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<MountEntry> {
        let mut out = self.entries.clone();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_are_stable_per_disk() {
        let mut letters = LetterAllocator::default();
        assert_eq!(letters.letter_for(Path::new("/d/a.mia")).unwrap(), 'A');
        assert_eq!(letters.letter_for(Path::new("/d/b.mia")).unwrap(), 'B');
        assert_eq!(letters.letter_for(Path::new("/d/a.mia")).unwrap(), 'A');
    }

    #[test]
    fn letters_run_out_after_z() {
        let mut letters = LetterAllocator::default();
        for i in 0..26 {
            letters.letter_for(Path::new(&format!("/d/{i}.mia"))).expect("letter");
        }
        assert!(matches!(
            letters.letter_for(Path::new("/d/extra.mia")),
            Err(VdfsError::NoSpace)
        ));
    }

    #[test]
    fn ids_follow_prefix_slot_letter() {
        let mut table = MountTable::new("89");
        let a = table.insert(Path::new("/nowhere/x.mia"), "Part1", 0).unwrap();
        let b = table.insert(Path::new("/nowhere/x.mia"), "Part2", 1).unwrap();
        let c = table.insert(Path::new("/nowhere/y.mia"), "Part1", 0).unwrap();
        assert_eq!((a.id.as_str(), b.id.as_str(), c.id.as_str()), ("891A", "892A", "891B"));
        assert!(matches!(
            table.insert(Path::new("/nowhere/x.mia"), "PART1", 0),
            Err(VdfsError::Exists(_))
        ));
        let ids: Vec<String> = table.list().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, ["891A", "891B", "892A"]);
    }

    #[test]
    fn removed_ids_are_unknown() {
        let mut table = MountTable::new("89");
        table.insert(Path::new("/nowhere/x.mia"), "p", 2).unwrap();
        assert_eq!(table.get("893a").unwrap().partition, "p");
        table.remove("893A").unwrap();
        assert!(matches!(table.get("893A"), Err(VdfsError::NotMounted(_))));
        assert!(matches!(table.remove("893A"), Err(VdfsError::NotMounted(_))));
        assert!(!table.has_disk(Path::new("/nowhere/x.mia")));
    }
}
