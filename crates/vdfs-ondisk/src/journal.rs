//! Journal slot record.

use crate::{OnDiskRecord, ensure_len, put};
use serde::{Deserialize, Serialize};
use vdfs_types::{
    JOURNAL_ENTRY_SIZE, JOURNAL_OP_LEN, JOURNAL_PATH_LEN, JOURNAL_PAYLOAD_LEN, ParseError,
    ensure_slice, nul_padded, read_fixed, read_le_i32, read_le_u32, trim_nul_padded,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Slot index.
    pub count: i32,
    pub op: String,
    pub path: String,
    pub payload: String,
    /// Unix seconds.
    pub date: u32,
}

impl JournalEntry {
    /// A slot is empty when its operation field is blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.op.is_empty()
    }
}

impl OnDiskRecord for JournalEntry {
    const SIZE: usize = JOURNAL_ENTRY_SIZE;

    fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, JOURNAL_ENTRY_SIZE)?;
        let path_at = 4 + JOURNAL_OP_LEN;
        let payload_at = path_at + JOURNAL_PATH_LEN;
        let date_at = payload_at + JOURNAL_PAYLOAD_LEN;
        Ok(Self {
            count: read_le_i32(bytes, 0)?,
            op: trim_nul_padded(&read_fixed::<JOURNAL_OP_LEN>(bytes, 4)?),
            path: trim_nul_padded(&read_fixed::<JOURNAL_PATH_LEN>(bytes, path_at)?),
            payload: payload_text(&read_fixed::<JOURNAL_PAYLOAD_LEN>(bytes, payload_at)?),
            date: read_le_u32(bytes, date_at)?,
        })
    }

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        ensure_len(buf, JOURNAL_ENTRY_SIZE)?;
        let path_at = 4 + JOURNAL_OP_LEN;
        let payload_at = path_at + JOURNAL_PATH_LEN;
        let date_at = payload_at + JOURNAL_PAYLOAD_LEN;
        put(buf, 0, &self.count.to_le_bytes());
        put(buf, 4, &nul_padded::<JOURNAL_OP_LEN>(&self.op, "journal_op")?);
        put(
            buf,
            path_at,
            &nul_padded::<JOURNAL_PATH_LEN>(&self.path, "journal_path")?,
        );
        put(
            buf,
            payload_at,
            &nul_padded::<JOURNAL_PAYLOAD_LEN>(&self.payload, "journal_payload")?,
        );
        put(buf, date_at, &self.date.to_le_bytes());
        Ok(())
    }
}

// Payloads carry file content, so surrounding whitespace is significant.
fn payload_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
