#![forbid(unsafe_code)]
//! Disk images and their partition tables.
//!
//! An image starts with a 153-byte MBR holding four partition slots. One of
//! them may be an extended partition whose range carries a chain of EBRs,
//! one per logical partition. Every function re-reads the MBR from the
//! device; nothing is cached.
//!
//! Placement: the fit mode is recorded but all three modes choose the first
//! empty table slot. A new primary or extended partition starts where the
//! nearest occupied slot before it ends (or right after the MBR), and may
//! not overlap any other partition.

use serde::Serialize;
use std::path::Path;
use vdfs_block::{ByteDevice, FileByteDevice};
use vdfs_error::{Result, VdfsError};
use vdfs_ondisk::{Ebr, Mbr, Partition, read_record, write_record};
use vdfs_types::{
    ByteOffset, EBR_SIZE, Fit, MBR_SIZE, PARTITION_NAME_LEN, PartitionKind, SizeUnit, unix_now,
};

/// Required extension of disk image files.
pub const DISK_EXTENSION: &str = "mia";

// ── Disk images ─────────────────────────────────────────────────────────────

fn check_extension(path: &Path) -> Result<()> {
    let ok = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(DISK_EXTENSION));
    if ok {
        Ok(())
    } else {
        Err(VdfsError::InvalidArgument(format!(
            "disk path {} must end in .{DISK_EXTENSION}",
            path.display()
        )))
    }
}

/// Disk signature derived from the image path and creation instant.
#[must_use]
pub fn disk_signature(path: &Path, created: f32) -> i32 {
    let seed = crc32c::crc32c(path.to_string_lossy().as_bytes());
    let crc = crc32c::crc32c_append(seed, &created.to_le_bytes());
    (crc & 0x7FFF_FFFF) as i32
}

/// Create a zero-filled image of `size` units with a fresh MBR.
pub fn create_disk(path: &Path, size: i64, unit: SizeUnit, fit: Fit) -> Result<Mbr> {
    check_extension(path)?;
    if size <= 0 {
        return Err(VdfsError::InvalidArgument(format!(
            "disk size must be positive, got {size}"
        )));
    }
    let bytes = unit
        .to_bytes(size)
        .map_err(|e| VdfsError::InvalidArgument(e.to_string()))?;
    if (bytes as usize) < MBR_SIZE {
        return Err(VdfsError::InvalidArgument(format!(
            "disk of {bytes} bytes cannot hold an MBR"
        )));
    }
    let dev = FileByteDevice::create(path, u64::try_from(bytes).unwrap_or(0))?;
    let created = unix_now() as f32;
    let mbr = Mbr::new(bytes, created, disk_signature(path, created), fit);
    write_mbr(&dev, &mbr)?;
    dev.sync()?;
    tracing::info!(path = %path.display(), bytes, ?fit, signature = mbr.signature, "disk created");
    Ok(mbr)
}

/// Delete an image file.
pub fn remove_disk(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(VdfsError::NotFound(path.display().to_string()));
    }
    std::fs::remove_file(path)?;
    tracing::info!(path = %path.display(), "disk removed");
    Ok(())
}

pub fn read_mbr<D: ByteDevice + ?Sized>(dev: &D) -> Result<Mbr> {
    read_record(dev, ByteOffset::ZERO)
}

pub fn write_mbr<D: ByteDevice + ?Sized>(dev: &D, mbr: &Mbr) -> Result<()> {
    write_record(dev, ByteOffset::ZERO, mbr)
}

fn offset(value: i32) -> Result<ByteOffset> {
    ByteOffset::from_start(value).map_err(|e| VdfsError::Corruption {
        offset: 0,
        detail: format!("{e}: {value}"),
    })
}

fn read_ebr<D: ByteDevice + ?Sized>(dev: &D, at: i32) -> Result<Ebr> {
    read_record(dev, offset(at)?)
}

fn write_ebr<D: ByteDevice + ?Sized>(dev: &D, ebr: &Ebr) -> Result<()> {
    write_record(dev, offset(ebr.start)?, ebr)
}

/// The EBR chain of an extended partition, head first. The head is
/// included even when it describes no logical partition.
pub fn read_ebr_chain<D: ByteDevice + ?Sized>(dev: &D, extended: &Partition) -> Result<Vec<Ebr>> {
    let mut chain = vec![read_ebr(dev, extended.start)?];
    let limit = extended.end();
    while let Some(last) = chain.last() {
        if last.next < 0 {
            break;
        }
        if i64::from(last.next) <= i64::from(last.start) || i64::from(last.next) >= limit {
            return Err(VdfsError::Corruption {
                offset: u64::try_from(last.start).unwrap_or(0),
                detail: format!("EBR next pointer {} escapes extended range", last.next),
            });
        }
        let next = read_ebr(dev, last.next)?;
        chain.push(next);
    }
    Ok(chain)
}

// ── Partition descriptions ──────────────────────────────────────────────────

/// Options for a new partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    pub size: i64,
    pub unit: SizeUnit,
    pub kind: PartitionKind,
    pub fit: Fit,
}

impl Default for PartitionSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            unit: SizeUnit::Kilo,
            kind: PartitionKind::Primary,
            fit: Fit::Worst,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeleteMode {
    /// Clear the table entry only.
    Fast,
    /// Zero the byte range, then clear the entry.
    Full,
}

impl DeleteMode {
    pub fn parse(text: &str) -> Result<Self> {
        match text.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "full" => Ok(Self::Full),
            other => Err(VdfsError::InvalidArgument(format!(
                "delete mode must be fast or full, got {other:?}"
            ))),
        }
    }
}

/// Report row for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    /// MBR slot for primary and extended partitions.
    pub slot: Option<usize>,
    pub name: String,
    pub kind: PartitionKind,
    pub fit: Option<Fit>,
    pub start: i32,
    pub size: i32,
    pub mounted: bool,
    pub id: String,
    /// Following EBR offset for logical partitions.
    pub next: Option<i32>,
}

impl PartitionInfo {
    fn from_slot(slot: usize, part: &Partition) -> Self {
        Self {
            slot: Some(slot),
            name: part.name.clone(),
            kind: part.kind.unwrap_or(PartitionKind::Primary),
            fit: part.fit,
            start: part.start,
            size: part.size,
            mounted: part.mounted,
            id: part.id.clone(),
            next: None,
        }
    }

    fn from_ebr(ebr: &Ebr) -> Self {
        Self {
            slot: None,
            name: ebr.name.clone(),
            kind: PartitionKind::Logical,
            fit: ebr.fit,
            start: ebr.start,
            size: ebr.size,
            mounted: ebr.mounted,
            id: String::new(),
            next: (ebr.next >= 0).then_some(ebr.next),
        }
    }

    #[must_use]
    pub fn end(&self) -> i64 {
        i64::from(self.start) + i64::from(self.size)
    }
}

/// Primary and extended partitions in slot order, each extended partition
/// followed by its logicals in chain order.
pub fn list_partitions<D: ByteDevice + ?Sized>(dev: &D) -> Result<Vec<PartitionInfo>> {
    let mbr = read_mbr(dev)?;
    let mut out = Vec::new();
    for (slot, part) in mbr.used() {
        out.push(PartitionInfo::from_slot(slot, part));
        if part.kind == Some(PartitionKind::Extended) {
            out.extend(
                read_ebr_chain(dev, part)?
                    .iter()
                    .filter(|ebr| ebr.is_used())
                    .map(PartitionInfo::from_ebr),
            );
        }
    }
    Ok(out)
}

/// Find a partition by name (case-insensitive) across slots and logicals.
pub fn find_partition<D: ByteDevice + ?Sized>(dev: &D, name: &str) -> Result<PartitionInfo> {
    list_partitions(dev)?
        .into_iter()
        .find(|info| info.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| VdfsError::NotFound(format!("partition {name}")))
}

// ── Create ──────────────────────────────────────────────────────────────────

fn validate_new_name<D: ByteDevice + ?Sized>(dev: &D, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VdfsError::InvalidArgument(
            "partition name cannot be empty".to_owned(),
        ));
    }
    if name.len() > PARTITION_NAME_LEN {
        return Err(VdfsError::InvalidArgument(format!(
            "partition name {name:?} exceeds {PARTITION_NAME_LEN} bytes"
        )));
    }
    if list_partitions(dev)?
        .iter()
        .any(|info| info.name.eq_ignore_ascii_case(name))
    {
        return Err(VdfsError::Exists(format!("partition {name}")));
    }
    Ok(())
}

fn overlaps(start: i64, end: i64, other_start: i64, other_end: i64) -> bool {
    start < other_end && other_start < end
}

/// Create a primary, extended or logical partition.
pub fn create_partition<D: ByteDevice + ?Sized>(dev: &D, spec: &PartitionSpec) -> Result<PartitionInfo> {
    if spec.size <= 0 {
        return Err(VdfsError::InvalidArgument(format!(
            "partition size must be positive, got {}",
            spec.size
        )));
    }
    let size = spec
        .unit
        .to_bytes(spec.size)
        .map_err(|e| VdfsError::InvalidArgument(e.to_string()))?;
    validate_new_name(dev, &spec.name)?;
    if spec.kind == PartitionKind::Logical {
        return create_logical_partition(dev, &spec.name, size, spec.fit);
    }

    let mut mbr = read_mbr(dev)?;
    if spec.kind == PartitionKind::Extended {
        if mbr.extended().is_some() {
            return Err(VdfsError::Exists("extended partition".to_owned()));
        }
        if (size as usize) <= EBR_SIZE {
            return Err(VdfsError::InvalidArgument(format!(
                "extended partition of {size} bytes cannot hold an EBR"
            )));
        }
    }

    let occupied: i64 = mbr.used().map(|(_, part)| i64::from(part.size)).sum();
    let available = i64::from(mbr.size) - (MBR_SIZE as i64 + occupied);
    if i64::from(size) > available {
        tracing::debug!(size, available, "partition does not fit on disk");
        return Err(VdfsError::NoSpace);
    }

    let slot = mbr
        .partitions
        .iter()
        .position(|part| !part.is_used())
        .ok_or(VdfsError::NoSpace)?;
    let start = mbr.partitions[..slot]
        .iter()
        .filter(|part| part.is_used())
        .map(Partition::end)
        .max()
        .unwrap_or(MBR_SIZE as i64);
    let end = start + i64::from(size);
    if end > i64::from(mbr.size)
        || mbr
            .used()
            .any(|(_, part)| overlaps(start, end, i64::from(part.start), part.end()))
    {
        tracing::debug!(slot, start, end, "slot range collides");
        return Err(VdfsError::NoSpace);
    }
    let start = i32::try_from(start).map_err(|_| VdfsError::NoSpace)?;

    mbr.partitions[slot] = Partition {
        mounted: false,
        kind: Some(spec.kind),
        fit: Some(spec.fit),
        start,
        size,
        name: spec.name.clone(),
        correlative: 0,
        id: String::new(),
    };
    write_mbr(dev, &mbr)?;
    if spec.kind == PartitionKind::Extended {
        write_ebr(dev, &Ebr::empty_at(start))?;
    }
    tracing::info!(name = %spec.name, kind = ?spec.kind, slot, start, size, "partition created");
    Ok(PartitionInfo::from_slot(slot, &mbr.partitions[slot]))
}

/// Append a logical partition to the extended partition's EBR chain.
///
/// `size` counts the EBR record itself, which sits at the start of the range.
pub fn create_logical_partition<D: ByteDevice + ?Sized>(
    dev: &D,
    name: &str,
    size: i32,
    fit: Fit,
) -> Result<PartitionInfo> {
    let mbr = read_mbr(dev)?;
    let (_, extended) = mbr
        .extended()
        .ok_or_else(|| VdfsError::NotFound("extended partition".to_owned()))?;
    if (size as usize) <= EBR_SIZE {
        return Err(VdfsError::InvalidArgument(format!(
            "logical partition of {size} bytes cannot hold its EBR"
        )));
    }
    let mut chain = read_ebr_chain(dev, extended)?;
    let head_free = chain.len() == 1 && !chain[0].is_used();

    let new_ebr = if head_free {
        let head = &chain[0];
        if i64::from(head.start) + i64::from(size) > extended.end() {
            return Err(VdfsError::NoSpace);
        }
        Ebr {
            mounted: false,
            fit: Some(fit),
            start: head.start,
            size,
            next: head.next,
            name: name.to_owned(),
        }
    } else {
        let last = chain
            .last_mut()
            .ok_or_else(|| VdfsError::Corruption {
                offset: 0,
                detail: "empty EBR chain".to_owned(),
            })?;
        let start = if last.is_used() { last.end() } else { i64::from(last.start) };
        if start + i64::from(size) > extended.end() {
            tracing::debug!(start, size, ext_end = extended.end(), "logical does not fit");
            return Err(VdfsError::NoSpace);
        }
        let start = i32::try_from(start).map_err(|_| VdfsError::NoSpace)?;
        if start != last.start {
            last.next = start;
            write_ebr(dev, last)?;
        }
        Ebr {
            mounted: false,
            fit: Some(fit),
            start,
            size,
            next: -1,
            name: name.to_owned(),
        }
    };
    write_ebr(dev, &new_ebr)?;
    tracing::info!(name, start = new_ebr.start, size, "logical partition created");
    Ok(PartitionInfo::from_ebr(&new_ebr))
}

// ── Delete ──────────────────────────────────────────────────────────────────

fn zero_span<D: ByteDevice + ?Sized>(dev: &D, start: i32, len: i64) -> Result<()> {
    if len <= 0 {
        return Ok(());
    }
    dev.zero_range(offset(start)?.0, u64::try_from(len).unwrap_or(0))
}

/// Delete a partition by name. Mounted partitions cannot be deleted.
pub fn delete_partition<D: ByteDevice + ?Sized>(dev: &D, name: &str, mode: DeleteMode) -> Result<()> {
    let mut mbr = read_mbr(dev)?;
    if let Some(slot) = mbr.partitions.iter().position(|p| p.name_matches(name)) {
        let part = mbr.partitions[slot].clone();
        if part.mounted {
            return Err(VdfsError::InvalidArgument(format!(
                "partition {name} is mounted"
            )));
        }
        if part.kind == Some(PartitionKind::Extended) {
            let chain = read_ebr_chain(dev, &part)?;
            if chain.iter().any(|ebr| ebr.mounted) {
                return Err(VdfsError::InvalidArgument(format!(
                    "extended partition {name} holds a mounted logical"
                )));
            }
            if mode == DeleteMode::Fast {
                for ebr in &chain {
                    zero_span(dev, ebr.start, EBR_SIZE as i64)?;
                }
            }
        }
        if mode == DeleteMode::Full {
            zero_span(dev, part.start, i64::from(part.size))?;
        }
        mbr.partitions[slot] = Partition::empty();
        write_mbr(dev, &mbr)?;
        tracing::info!(name, slot, ?mode, "partition deleted");
        return Ok(());
    }

    let Some((_, extended)) = mbr.extended() else {
        return Err(VdfsError::NotFound(format!("partition {name}")));
    };
    let chain = read_ebr_chain(dev, extended)?;
    let Some(pos) = chain
        .iter()
        .position(|ebr| ebr.is_used() && ebr.name.eq_ignore_ascii_case(name))
    else {
        return Err(VdfsError::NotFound(format!("partition {name}")));
    };
    let target = chain[pos].clone();
    if target.mounted {
        return Err(VdfsError::InvalidArgument(format!(
            "partition {name} is mounted"
        )));
    }
    if pos == 0 {
        if mode == DeleteMode::Full {
            let data_start = i64::from(target.start) + EBR_SIZE as i64;
            let data_start = i32::try_from(data_start).map_err(|_| VdfsError::NoSpace)?;
            zero_span(dev, data_start, i64::from(target.size) - EBR_SIZE as i64)?;
        }
        let mut head = Ebr::empty_at(target.start);
        head.next = target.next;
        write_ebr(dev, &head)?;
    } else {
        let mut prev = chain[pos - 1].clone();
        prev.next = target.next;
        write_ebr(dev, &prev)?;
        if mode == DeleteMode::Full {
            zero_span(dev, target.start, i64::from(target.size))?;
        }
    }
    tracing::info!(name, ?mode, "logical partition deleted");
    Ok(())
}

// ── Resize ──────────────────────────────────────────────────────────────────

/// Grow or shrink a partition by `delta` bytes.
///
/// Growth is bounded by the next partition start after this one's end (or
/// the disk end); logicals are bounded by the next EBR or the extended end.
pub fn resize_partition<D: ByteDevice + ?Sized>(dev: &D, name: &str, delta: i64) -> Result<PartitionInfo> {
    let mut mbr = read_mbr(dev)?;
    if let Some(slot) = mbr.partitions.iter().position(|p| p.name_matches(name)) {
        let part = mbr.partitions[slot].clone();
        let new_size = i64::from(part.size) + delta;
        if new_size <= 0 {
            return Err(VdfsError::InvalidArgument(format!(
                "resize would leave {name} with {new_size} bytes"
            )));
        }
        if delta > 0 {
            let limit = mbr
                .used()
                .filter(|(other, _)| *other != slot)
                .map(|(_, p)| i64::from(p.start))
                .filter(|start| *start >= part.end())
                .min()
                .unwrap_or_else(|| i64::from(mbr.size));
            if part.end() + delta > limit {
                tracing::debug!(name, delta, room = limit - part.end(), "no room to grow");
                return Err(VdfsError::NoSpace);
            }
        } else if part.kind == Some(PartitionKind::Extended) {
            let used_end = read_ebr_chain(dev, &part)?
                .iter()
                .filter(|ebr| ebr.is_used())
                .map(Ebr::end)
                .max()
                .unwrap_or(i64::from(part.start) + EBR_SIZE as i64);
            if i64::from(part.start) + new_size < used_end {
                return Err(VdfsError::InvalidArgument(format!(
                    "shrinking {name} would cut off logical partitions"
                )));
            }
        }
        mbr.partitions[slot].size = i32::try_from(new_size).map_err(|_| VdfsError::NoSpace)?;
        write_mbr(dev, &mbr)?;
        tracing::info!(name, delta, size = new_size, "partition resized");
        return Ok(PartitionInfo::from_slot(slot, &mbr.partitions[slot]));
    }

    let Some((_, extended)) = mbr.extended() else {
        return Err(VdfsError::NotFound(format!("partition {name}")));
    };
    let extended_end = extended.end();
    let chain = read_ebr_chain(dev, extended)?;
    let mut target = chain
        .iter()
        .find(|ebr| ebr.is_used() && ebr.name.eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| VdfsError::NotFound(format!("partition {name}")))?;
    let new_size = i64::from(target.size) + delta;
    if new_size <= EBR_SIZE as i64 {
        return Err(VdfsError::InvalidArgument(format!(
            "resize would leave {name} with {new_size} bytes"
        )));
    }
    if delta > 0 {
        let limit = if target.next >= 0 {
            i64::from(target.next)
        } else {
            extended_end
        };
        if target.end() + delta > limit {
            return Err(VdfsError::NoSpace);
        }
    }
    target.size = i32::try_from(new_size).map_err(|_| VdfsError::NoSpace)?;
    write_ebr(dev, &target)?;
    tracing::info!(name, delta, size = new_size, "logical partition resized");
    Ok(PartitionInfo::from_ebr(&target))
}

// ── Mount flags ─────────────────────────────────────────────────────────────

/// Write the mount status of primary slot `slot` into the MBR.
pub fn set_mount_state<D: ByteDevice + ?Sized>(dev: &D, slot: usize, id: Option<&str>) -> Result<Partition> {
    let mut mbr = read_mbr(dev)?;
    let part = mbr
        .partitions
        .get_mut(slot)
        .filter(|part| part.is_used())
        .ok_or_else(|| VdfsError::NotFound(format!("partition slot {slot}")))?;
    match id {
        Some(id) => {
            part.mounted = true;
            part.correlative = i32::try_from(slot + 1).unwrap_or(0);
            id.clone_into(&mut part.id);
        }
        None => {
            part.mounted = false;
            part.correlative = 0;
            part.id.clear();
        }
    }
    let updated = part.clone();
    write_mbr(dev, &mbr)?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vdfs_block::MemoryByteDevice;

    const DISK: i32 = 64 * 1024;

    fn blank_disk(size: i32) -> MemoryByteDevice {
        let dev = MemoryByteDevice::new(size as usize);
        write_mbr(&dev, &Mbr::new(size, 0.0, 7, Fit::First)).expect("mbr");
        dev
    }

    fn spec(name: &str, bytes: i64, kind: PartitionKind) -> PartitionSpec {
        PartitionSpec {
            name: name.to_owned(),
            size: bytes,
            unit: SizeUnit::Bytes,
            kind,
            ..PartitionSpec::default()
        }
    }

    fn assert_no_overlap(dev: &MemoryByteDevice) {
        let mbr = read_mbr(dev).expect("mbr");
        let used: Vec<&Partition> = mbr.used().map(|(_, p)| p).collect();
        for (i, a) in used.iter().enumerate() {
            assert!(a.start >= MBR_SIZE as i32, "{} starts inside the MBR", a.name);
            assert!(a.end() <= i64::from(mbr.size), "{} runs past the disk", a.name);
            for b in &used[i + 1..] {
                assert!(
                    !overlaps(i64::from(a.start), a.end(), i64::from(b.start), b.end()),
                    "{} overlaps {}",
                    a.name,
                    b.name
                );
            }
        }
    }

    // ── Disk image tests ────────────────────────────────────────────────

    #[test]
    fn create_disk_writes_mbr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a/Disco1.mia");
        let mbr = create_disk(&path, 2, SizeUnit::Kilo, Fit::Best).expect("create");
        assert_eq!(mbr.size, 2048);
        assert!(mbr.signature >= 0);
        let dev = FileByteDevice::open(&path).expect("open");
        assert_eq!(dev.len_bytes(), 2048);
        let back = read_mbr(&dev).expect("read");
        assert_eq!(back.fit, Fit::Best);
        assert_eq!(back.used().count(), 0);
        assert!(back.partitions.iter().all(|p| p.start == -1 && p.size == -1));
    }

    #[test]
    fn create_disk_validates_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            create_disk(&dir.path().join("disk.img"), 1, SizeUnit::Kilo, Fit::First),
            Err(VdfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            create_disk(&dir.path().join("disk.mia"), 0, SizeUnit::Kilo, Fit::First),
            Err(VdfsError::InvalidArgument(_))
        ));
        let path = dir.path().join("disk.MIA");
        create_disk(&path, 1, SizeUnit::Kilo, Fit::First).expect("upper-case extension");
        assert!(matches!(
            create_disk(&path, 1, SizeUnit::Kilo, Fit::First),
            Err(VdfsError::Exists(_))
        ));
        remove_disk(&path).expect("remove");
        assert!(matches!(remove_disk(&path), Err(VdfsError::NotFound(_))));
    }

    #[test]
    fn signature_depends_on_path_and_time() {
        let a = disk_signature(Path::new("/tmp/a.mia"), 1.0);
        let b = disk_signature(Path::new("/tmp/b.mia"), 1.0);
        let c = disk_signature(Path::new("/tmp/a.mia"), 2.0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a >= 0 && b >= 0 && c >= 0);
    }

    // ── Primary/extended tests ──────────────────────────────────────────

    #[test]
    fn primaries_are_placed_sequentially() {
        let dev = blank_disk(DISK);
        let a = create_partition(&dev, &spec("A", 1000, PartitionKind::Primary)).expect("A");
        let b = create_partition(&dev, &spec("B", 2000, PartitionKind::Primary)).expect("B");
        assert_eq!((a.slot, a.start), (Some(0), MBR_SIZE as i32));
        assert_eq!((b.slot, b.start), (Some(1), MBR_SIZE as i32 + 1000));
        assert_no_overlap(&dev);
    }

    #[test]
    fn duplicate_and_long_names() {
        let dev = blank_disk(DISK);
        create_partition(&dev, &spec("Part", 100, PartitionKind::Primary)).expect("first");
        assert!(matches!(
            create_partition(&dev, &spec("PART", 100, PartitionKind::Primary)),
            Err(VdfsError::Exists(_))
        ));
        assert!(matches!(
            create_partition(&dev, &spec("seventeen-chars!!", 100, PartitionKind::Primary)),
            Err(VdfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn space_and_slot_exhaustion() {
        let dev = blank_disk(2000);
        assert!(matches!(
            create_partition(&dev, &spec("big", 1900, PartitionKind::Primary)),
            Err(VdfsError::NoSpace)
        ));
        for name in ["p1", "p2", "p3", "p4"] {
            create_partition(&dev, &spec(name, 100, PartitionKind::Primary)).expect(name);
        }
        assert!(matches!(
            create_partition(&dev, &spec("p5", 100, PartitionKind::Primary)),
            Err(VdfsError::NoSpace)
        ));
    }

    #[test]
    fn freed_slot_is_reused_without_overlap() {
        let dev = blank_disk(DISK);
        create_partition(&dev, &spec("a", 1000, PartitionKind::Primary)).expect("a");
        create_partition(&dev, &spec("b", 1000, PartitionKind::Primary)).expect("b");
        delete_partition(&dev, "a", DeleteMode::Fast).expect("delete");
        // Slot 0 is free again but only 1000 bytes lie before "b".
        assert!(matches!(
            create_partition(&dev, &spec("c", 1500, PartitionKind::Primary)),
            Err(VdfsError::NoSpace)
        ));
        let c = create_partition(&dev, &spec("c", 800, PartitionKind::Primary)).expect("c");
        assert_eq!((c.slot, c.start), (Some(0), MBR_SIZE as i32));
        assert_no_overlap(&dev);
    }

    #[test]
    fn single_extended_with_head_ebr() {
        let dev = blank_disk(DISK);
        let ext = create_partition(&dev, &spec("ext", 4000, PartitionKind::Extended)).expect("ext");
        let head = read_ebr(&dev, ext.start).expect("head");
        assert_eq!(head, Ebr::empty_at(ext.start));
        assert!(matches!(
            create_partition(&dev, &spec("ext2", 100, PartitionKind::Extended)),
            Err(VdfsError::Exists(_))
        ));
    }

    // ── Logical tests ───────────────────────────────────────────────────

    #[test]
    fn logical_requires_extended() {
        let dev = blank_disk(DISK);
        assert!(matches!(
            create_partition(&dev, &spec("l1", 100, PartitionKind::Logical)),
            Err(VdfsError::NotFound(_))
        ));
    }

    #[test]
    fn logicals_chain_inside_extended() {
        let dev = blank_disk(DISK);
        let ext = create_partition(&dev, &spec("ext", 1000, PartitionKind::Extended)).expect("ext");
        let l1 = create_partition(&dev, &spec("l1", 300, PartitionKind::Logical)).expect("l1");
        let l2 = create_partition(&dev, &spec("l2", 300, PartitionKind::Logical)).expect("l2");
        assert_eq!(l1.start, ext.start, "first logical claims the head EBR");
        assert_eq!(l2.start, ext.start + 300);
        assert!(matches!(
            create_partition(&dev, &spec("l3", 500, PartitionKind::Logical)),
            Err(VdfsError::NoSpace)
        ));

        let listed: Vec<String> = list_partitions(&dev).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(listed, ["ext", "l1", "l2"]);
        let mbr = read_mbr(&dev).unwrap();
        let chain = read_ebr_chain(&dev, mbr.extended().unwrap().1).unwrap();
        assert_eq!(chain[0].next, l2.start);
        assert_eq!(chain[1].next, -1);
    }

    #[test]
    fn deleting_logicals_relinks_chain() {
        let dev = blank_disk(DISK);
        create_partition(&dev, &spec("ext", 2000, PartitionKind::Extended)).expect("ext");
        for name in ["l1", "l2", "l3"] {
            create_partition(&dev, &spec(name, 300, PartitionKind::Logical)).expect(name);
        }
        delete_partition(&dev, "l2", DeleteMode::Full).expect("delete middle");
        let names: Vec<String> = list_partitions(&dev).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["ext", "l1", "l3"]);

        delete_partition(&dev, "l1", DeleteMode::Fast).expect("delete head");
        let names: Vec<String> = list_partitions(&dev).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["ext", "l3"], "chain continues past a cleared head");
        assert!(matches!(
            delete_partition(&dev, "l1", DeleteMode::Fast),
            Err(VdfsError::NotFound(_))
        ));
    }

    #[test]
    fn full_delete_zeroes_range() {
        let dev = blank_disk(DISK);
        let a = create_partition(&dev, &spec("a", 500, PartitionKind::Primary)).expect("a");
        dev.write_all_at(a.start as u64 + 10, b"payload").expect("fill");
        delete_partition(&dev, "a", DeleteMode::Full).expect("delete");
        assert_eq!(dev.read_vec(a.start as u64 + 10, 7).unwrap(), [0_u8; 7]);
        assert_eq!(read_mbr(&dev).unwrap().used().count(), 0);
    }

    #[test]
    fn mounted_partition_cannot_be_deleted() {
        let dev = blank_disk(DISK);
        create_partition(&dev, &spec("a", 500, PartitionKind::Primary)).expect("a");
        set_mount_state(&dev, 0, Some("891A")).expect("mount");
        assert!(matches!(
            delete_partition(&dev, "a", DeleteMode::Fast),
            Err(VdfsError::InvalidArgument(_))
        ));
        let part = set_mount_state(&dev, 0, None).expect("unmount");
        assert!(!part.mounted);
        assert_eq!(part.correlative, 0);
        delete_partition(&dev, "a", DeleteMode::Fast).expect("delete after unmount");
    }

    // ── Resize tests ────────────────────────────────────────────────────

    #[test]
    fn resize_respects_neighbours() {
        let dev = blank_disk(4000);
        create_partition(&dev, &spec("a", 1000, PartitionKind::Primary)).expect("a");
        create_partition(&dev, &spec("b", 1000, PartitionKind::Primary)).expect("b");
        assert!(matches!(resize_partition(&dev, "a", 1), Err(VdfsError::NoSpace)));
        let b = resize_partition(&dev, "b", 500).expect("grow b");
        assert_eq!(b.size, 1500);
        assert!(matches!(
            resize_partition(&dev, "b", 4000),
            Err(VdfsError::NoSpace)
        ));
        let a = resize_partition(&dev, "a", -400).expect("shrink a");
        assert_eq!(a.size, 600);
        assert!(matches!(
            resize_partition(&dev, "a", -600),
            Err(VdfsError::InvalidArgument(_))
        ));
        assert_no_overlap(&dev);
    }

    #[test]
    fn resize_logical_within_extended() {
        let dev = blank_disk(DISK);
        create_partition(&dev, &spec("ext", 1000, PartitionKind::Extended)).expect("ext");
        create_partition(&dev, &spec("l1", 200, PartitionKind::Logical)).expect("l1");
        create_partition(&dev, &spec("l2", 200, PartitionKind::Logical)).expect("l2");
        assert!(matches!(resize_partition(&dev, "l1", 10), Err(VdfsError::NoSpace)));
        let l2 = resize_partition(&dev, "l2", 600).expect("grow l2");
        assert_eq!(l2.size, 800);
        assert!(matches!(resize_partition(&dev, "l2", 1), Err(VdfsError::NoSpace)));
        assert!(matches!(
            resize_partition(&dev, "ext", -500),
            Err(VdfsError::InvalidArgument(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn placement_never_overlaps(
            sizes in proptest::collection::vec((1_i64..20_000, 0_u8..3, any::<bool>()), 1..8),
        ) {
            let dev = blank_disk(DISK);
            for (i, (size, fit, delete_after)) in sizes.into_iter().enumerate() {
                let fit = [Fit::Best, Fit::First, Fit::Worst][fit as usize];
                let name = format!("p{i}");
                let result = create_partition(&dev, &PartitionSpec { fit, ..spec(&name, size, PartitionKind::Primary) });
                match result {
                    Ok(info) => {
                        prop_assert!(info.end() <= i64::from(DISK));
                        if delete_after {
                            delete_partition(&dev, &name, DeleteMode::Fast).expect("delete");
                        }
                    }
                    Err(VdfsError::NoSpace) => {}
                    Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                }
                assert_no_overlap(&dev);
            }
        }
    }
}
