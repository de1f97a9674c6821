// record.rs
// Journal record and its on-disk framing.
//
// Frame layout (little-endian):
// ┌────────────┬────────────┬───────────┐
// │ u32 len    │ u32 crc32  │ payload…  │
// └────────────┴────────────┴───────────┘
// - `len`    : number of bytes in payload
// - `crc32`  : checksum of payload for torn-write and corruption detection
// - payload  : postcard encoding of `JournalRecord`
//
use std::collections::BTreeSet;
use std::path::Path;

use crc32fast::Hasher;
use minitx_common::{GlobalTransactionId, RecordStatus};
use serde::{Deserialize, Serialize};

use crate::error::{JournalError, JournalResult};

pub const FRAME_HEADER_SIZE: usize = 8; // 4 bytes length + 4 bytes crc32

/// One status transition of one global transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub status: RecordStatus,
    pub gtrid: GlobalTransactionId,
    /// Unique names of the resources this record is about.
    pub unique_names: BTreeSet<String>,
    /// Journal-wide sequence number, strictly increasing.
    pub sequence: u64,
    /// Wall-clock time of the write, milliseconds since the unix epoch.
    pub time: i64,
}

impl JournalRecord {
    pub fn to_bytes(&self) -> JournalResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| JournalError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8], path: &Path, offset: u64) -> JournalResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| JournalError::DeserializationFailed {
            path: path.to_path_buf(),
            offset,
            reason: e.to_string(),
        })
    }

    /// Builds the full frame for this record: header followed by payload.
    pub fn encode_frame(&self) -> JournalResult<Vec<u8>> {
        let payload = self.to_bytes()?;
        let len = payload.len() as u32;
        let checksum = checksum(&payload);

        let mut data = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&checksum.to_le_bytes());
        data.extend_from_slice(&payload);
        Ok(data)
    }
}

pub(crate) fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Result of decoding the record area of one journal file.
#[derive(Debug, Default)]
pub struct FrameScan {
    pub records: Vec<JournalRecord>,
    /// Offset just past the last intact frame.
    pub valid_len: u64,
    /// True if trailing bytes after `valid_len` belong to an incomplete write.
    pub torn_tail: bool,
}

/// Decodes every frame in `bytes[start..]`.
///
/// A frame that is cut short by the end of the data, or whose checksum fails
/// while it is the very last frame, is an incomplete write and ends the scan.
/// A checksum failure followed by more data is corruption and fails the scan.
pub fn scan_frames(bytes: &[u8], start: usize, path: &Path) -> JournalResult<FrameScan> {
    let mut scan = FrameScan {
        records: Vec::new(),
        valid_len: start as u64,
        torn_tail: false,
    };
    let mut pos = start;

    while pos < bytes.len() {
        let remaining = bytes.len() - pos;
        if remaining < FRAME_HEADER_SIZE {
            scan.torn_tail = true;
            break;
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[pos..pos + 4]);
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[pos + 4..pos + FRAME_HEADER_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let expected = u32::from_le_bytes(crc_bytes);

        let end = match (pos + FRAME_HEADER_SIZE).checked_add(len) {
            Some(end) if end <= bytes.len() => end,
            _ => {
                scan.torn_tail = true;
                break;
            }
        };

        let payload = &bytes[pos + FRAME_HEADER_SIZE..end];
        if checksum(payload) != expected {
            if end == bytes.len() {
                scan.torn_tail = true;
                break;
            }
            return Err(JournalError::Corrupted {
                path: path.to_path_buf(),
                offset: pos as u64,
            });
        }

        scan.records
            .push(JournalRecord::from_bytes(payload, path, pos as u64)?);
        pos = end;
        scan.valid_len = pos as u64;
    }

    Ok(scan)
}
