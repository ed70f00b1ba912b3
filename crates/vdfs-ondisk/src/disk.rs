//! Partition table records: MBR, its four partition slots, and the EBRs
//! chained inside an extended partition.

use crate::{OnDiskRecord, ensure_len, put};
use serde::{Deserialize, Serialize};
use vdfs_types::{
    EBR_SIZE, Fit, MBR_SIZE, PARTITION_ID_LEN, PARTITION_NAME_LEN, PARTITION_SIZE,
    PARTITION_SLOTS, ParseError, PartitionKind, ensure_slice, nul_padded, read_fixed,
    read_le_f32, read_le_i32, read_u8, trim_nul_padded,
};

const STATUS_MOUNTED: u8 = b'1';
const STATUS_UNMOUNTED: u8 = b'0';

fn optional_fit(byte: u8) -> Result<Option<Fit>, ParseError> {
    if byte == 0 || byte == b'0' {
        Ok(None)
    } else {
        Fit::from_byte(byte).map(Some)
    }
}

fn fit_byte(fit: Option<Fit>) -> u8 {
    fit.map_or(0, Fit::as_byte)
}

/// One slot of the MBR partition table.
///
/// An unused slot has `start == size == -1` and no kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub mounted: bool,
    pub kind: Option<PartitionKind>,
    pub fit: Option<Fit>,
    pub start: i32,
    pub size: i32,
    pub name: String,
    pub correlative: i32,
    pub id: String,
}

impl Partition {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            mounted: false,
            kind: None,
            fit: None,
            start: -1,
            size: -1,
            name: String::new(),
            correlative: 0,
            id: String::new(),
        }
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.start >= 0 && self.size >= 0 && self.kind.is_some()
    }

    /// Exclusive end offset. Only meaningful for used slots.
    #[must_use]
    pub fn end(&self) -> i64 {
        i64::from(self.start) + i64::from(self.size)
    }

    #[must_use]
    pub fn name_matches(&self, name: &str) -> bool {
        self.is_used() && self.name.eq_ignore_ascii_case(name)
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::empty()
    }
}

impl OnDiskRecord for Partition {
    const SIZE: usize = PARTITION_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, PARTITION_SIZE)?;
        let kind_byte = read_u8(bytes, 1)?;
        let kind = if kind_byte == 0 || kind_byte == b'0' {
            None
        } else {
            Some(PartitionKind::from_byte(kind_byte)?)
        };
        Ok(Self {
            mounted: read_u8(bytes, 0)? == STATUS_MOUNTED,
            kind,
            fit: optional_fit(read_u8(bytes, 2)?)?,
            start: read_le_i32(bytes, 3)?,
            size: read_le_i32(bytes, 7)?,
            name: trim_nul_padded(&read_fixed::<PARTITION_NAME_LEN>(bytes, 11)?),
            correlative: read_le_i32(bytes, 27)?,
            id: trim_nul_padded(&read_fixed::<PARTITION_ID_LEN>(bytes, 31)?),
        })
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, PARTITION_SIZE)?;
        buf[0] = if self.mounted {
            STATUS_MOUNTED
        } else {
            STATUS_UNMOUNTED
        };
        buf[1] = self.kind.map_or(0, PartitionKind::as_byte);
        buf[2] = fit_byte(self.fit);
        put(buf, 3, &self.start.to_le_bytes());
        put(buf, 7, &self.size.to_le_bytes());
        put(
            buf,
            11,
            &nul_padded::<PARTITION_NAME_LEN>(&self.name, "partition_name")?,
        );
        put(buf, 27, &self.correlative.to_le_bytes());
        put(buf, 31, &nul_padded::<PARTITION_ID_LEN>(&self.id, "partition_id")?);
        Ok(())
    }
}

/// Master boot record at offset 0 of every image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mbr {
    pub size: i32,
    pub created: f32,
    pub signature: i32,
    pub fit: Fit,
    pub partitions: [Partition; PARTITION_SLOTS],
}

impl Mbr {
    #[must_use]
    pub fn new(size: i32, created: f32, signature: i32, fit: Fit) -> Self {
        Self {
            size,
            created,
            signature,
            fit,
            partitions: std::array::from_fn(|_| Partition::empty()),
        }
    }

    /// Used slots with their indexes.
    pub fn used(&self) -> impl Iterator<Item = (usize, &Partition)> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, part)| part.is_used())
    }

    #[must_use]
    pub fn extended(&self) -> Option<(usize, &Partition)> {
        self.used()
            .find(|(_, part)| part.kind == Some(PartitionKind::Extended))
    }
}

impl OnDiskRecord for Mbr {
    const SIZE: usize = MBR_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, MBR_SIZE)?;
        let mut partitions: [Partition; PARTITION_SLOTS] = std::array::from_fn(|_| Partition::empty());
        for (slot, part) in partitions.iter_mut().enumerate() {
            let at = 13 + slot * PARTITION_SIZE;
            *part = Partition::parse_from_bytes(ensure_slice(bytes, at, PARTITION_SIZE)?)?;
        }
        let size = read_le_i32(bytes, 0)?;
        if size <= 0 {
            return Err(ParseError::InvalidField {
                field: "mbr_size",
                reason: "must be positive",
            });
        }
        Ok(Self {
            size,
            created: read_le_f32(bytes, 4)?,
            signature: read_le_i32(bytes, 8)?,
            fit: Fit::from_byte(read_u8(bytes, 12)?)?,
            partitions,
        })
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, MBR_SIZE)?;
        put(buf, 0, &self.size.to_le_bytes());
        put(buf, 4, &self.created.to_le_bytes());
        put(buf, 8, &self.signature.to_le_bytes());
        buf[12] = self.fit.as_byte();
        for (slot, part) in self.partitions.iter().enumerate() {
            let at = 13 + slot * PARTITION_SIZE;
            part.encode_into(&mut buf[at..at + PARTITION_SIZE])?;
        }
        Ok(())
    }
}

/// Extended boot record describing one logical partition.
///
/// The record lives at `start`; the logical's data follows it. `next` is the
/// absolute offset of the following EBR or `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ebr {
    pub mounted: bool,
    pub fit: Option<Fit>,
    pub start: i32,
    pub size: i32,
    pub next: i32,
    pub name: String,
}

impl Ebr {
    /// Head EBR written when an extended partition is created.
    #[must_use]
    pub fn empty_at(start: i32) -> Self {
        Self {
            mounted: false,
            fit: None,
            start,
            size: 0,
            next: -1,
            name: String::new(),
        }
    }

    /// Whether this EBR describes a logical partition.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.size > 0
    }

    #[must_use]
    pub fn end(&self) -> i64 {
        i64::from(self.start) + i64::from(self.size)
    }
}

impl OnDiskRecord for Ebr {
    const SIZE: usize = EBR_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, EBR_SIZE)?;
        Ok(Self {
            mounted: read_u8(bytes, 0)? == STATUS_MOUNTED,
            fit: optional_fit(read_u8(bytes, 1)?)?,
            start: read_le_i32(bytes, 2)?,
            size: read_le_i32(bytes, 6)?,
            next: read_le_i32(bytes, 10)?,
            name: trim_nul_padded(&read_fixed::<PARTITION_NAME_LEN>(bytes, 14)?),
        })
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, EBR_SIZE)?;
        buf[0] = if self.mounted {
            STATUS_MOUNTED
        } else {
            STATUS_UNMOUNTED
        };
        buf[1] = fit_byte(self.fit);
        put(buf, 2, &self.start.to_le_bytes());
        put(buf, 6, &self.size.to_le_bytes());
        put(buf, 10, &self.next.to_le_bytes());
        put(
            buf,
            14,
            &nul_padded::<PARTITION_NAME_LEN>(&self.name, "ebr_name")?,
        );
        Ok(())
    }
}
