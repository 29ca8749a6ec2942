//! Journal entry framing.
//!
//! Each entry on disk:
//!
//! ```text
//! | magic "OSJL" (4) | version u16 | type u8 | payload len u32 | payload | crc32 u32 |
//! ```
//!
//! The CRC covers header and payload. Payloads are JSON.

use crate::error::{StorageError, StorageResult};
use crate::key::RecordKey;
use crate::schema::StoreSchema;
use crate::store::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Magic bytes that open every journal entry.
pub const JOURNAL_MAGIC: [u8; 4] = *b"OSJL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 1 + 4;
const CRC_SIZE: usize = 4;

const TYPE_OPS: u8 = 1;
const TYPE_SNAPSHOT: u8 = 2;

/// One primitive mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub(crate) enum JournalOp {
    Provision { schema: StoreSchema },
    Put { collection: String, record: Document },
    Delete { collection: String, key: RecordKey },
    Clear { collection: String },
}

/// Full store contents, written by compaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub schema: StoreSchema,
    pub collections: BTreeMap<String, Vec<Document>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JournalEntry {
    /// Ops applied together or not at all.
    Ops(Vec<JournalOp>),
    /// Replaces everything before it.
    Snapshot(Snapshot),
}

impl JournalEntry {
    pub(crate) fn encode(&self) -> StorageResult<Vec<u8>> {
        let (entry_type, payload) = match self {
            JournalEntry::Ops(ops) => (TYPE_OPS, serde_json::to_vec(ops)?),
            JournalEntry::Snapshot(snapshot) => (TYPE_SNAPSHOT, serde_json::to_vec(snapshot)?),
        };

        let len = u32::try_from(payload.len()).map_err(|_| {
            StorageError::Corrupted(format!(
                "journal entry of {} bytes exceeds the format limit",
                payload.len()
            ))
        })?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&JOURNAL_MAGIC);
        buf.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        buf.push(entry_type);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

/// Result of scanning a journal.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    /// Entries that decoded cleanly, in order.
    pub entries: Vec<JournalEntry>,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// Why scanning stopped early, if it did.
    pub stopped: Option<String>,
}

/// Decodes entries until the end of `bytes` or the first bad entry.
///
/// Anything after a bad entry is treated as a torn write and excluded from
/// `valid_len`.
pub(crate) fn scan(bytes: &[u8]) -> Scan {
    let mut scan = Scan::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        match decode_at(bytes, pos) {
            Ok((entry, next)) => {
                scan.entries.push(entry);
                pos = next;
                scan.valid_len = pos as u64;
            }
            Err(reason) => {
                scan.stopped = Some(format!("offset {pos}: {reason}"));
                break;
            }
        }
    }

    scan
}

fn decode_at(bytes: &[u8], start: usize) -> Result<(JournalEntry, usize), String> {
    let header = bytes
        .get(start..start + HEADER_SIZE)
        .ok_or_else(|| "truncated header".to_string())?;

    if header[0..4] != JOURNAL_MAGIC {
        return Err("invalid magic".into());
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > JOURNAL_VERSION {
        return Err(format!("unsupported version {version}"));
    }

    let entry_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

    let payload_start = start + HEADER_SIZE;
    let payload_end = payload_start + payload_len;
    let crc_bytes = bytes
        .get(payload_end..payload_end + CRC_SIZE)
        .ok_or_else(|| "truncated entry".to_string())?;

    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed = compute_crc32(&bytes[start..payload_end]);
    if stored != computed {
        return Err(format!(
            "checksum mismatch: expected {stored:08x}, got {computed:08x}"
        ));
    }

    let payload = &bytes[payload_start..payload_end];
    let entry = match entry_type {
        TYPE_OPS => JournalEntry::Ops(serde_json::from_slice(payload).map_err(|e| e.to_string())?),
        TYPE_SNAPSHOT => {
            JournalEntry::Snapshot(serde_json::from_slice(payload).map_err(|e| e.to_string())?)
        }
        other => return Err(format!("unknown entry type {other}")),
    };

    Ok((entry, payload_end + CRC_SIZE))
}

/// CRC-32 (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(id: i64) -> JournalOp {
        let record = json!({"id": id, "title": "t"});
        JournalOp::Put {
            collection: "tasks".into(),
            record: record.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn scan_reads_every_complete_entry() {
        let mut bytes = JournalEntry::Ops(vec![put(1)]).encode().unwrap();
        bytes.extend(JournalEntry::Ops(vec![put(2), put(3)]).encode().unwrap());

        let scan = scan(&bytes);
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.valid_len, bytes.len() as u64);
        assert!(scan.stopped.is_none());
    }

    #[test]
    fn scan_stops_at_torn_tail() {
        let first = JournalEntry::Ops(vec![put(1)]).encode().unwrap();
        let second = JournalEntry::Ops(vec![put(2)]).encode().unwrap();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let scan = scan(&bytes);
        assert_eq!(scan.entries, vec![JournalEntry::Ops(vec![put(1)])]);
        assert_eq!(scan.valid_len, first.len() as u64);
        assert!(scan.stopped.unwrap().contains("truncated"));
    }

    #[test]
    fn scan_rejects_flipped_bit() {
        let mut bytes = JournalEntry::Ops(vec![put(1)]).encode().unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x01;

        let scan = scan(&bytes);
        assert!(scan.entries.is_empty());
        assert_eq!(scan.valid_len, 0);
        assert!(scan.stopped.unwrap().contains("checksum"));
    }
}
