//! Write-ahead transaction journal for the minitx coordinator.
//!
//! The journal records every status transition of a global transaction that
//! recovery may need. [`DiskJournal`] keeps the records in two alternating
//! files; [`NullJournal`] keeps nothing and exists for tests and for setups
//! that explicitly give up crash recovery.

pub mod dangling;
pub mod disk;
pub mod error;
pub mod null;
pub mod record;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

pub use dangling::{DanglingTransaction, collect_dangling};
pub use disk::{DiskJournal, FileState, JournalImage};
pub use error::{JournalError, JournalResult};
use minitx_common::{GlobalTransactionId, RecordStatus};
pub use null::NullJournal;
pub use record::JournalRecord;
use serde::{Deserialize, Serialize};

/// Durable log of transaction status transitions.
///
/// Implementations serialize writers internally, so a journal is shared as
/// `Arc<dyn TransactionJournal>` between the executor and the recoverer.
pub trait TransactionJournal: Send + Sync {
    /// Appends a record. Records whose status requires it are forced to stable
    /// storage before this returns.
    fn log(
        &self,
        status: RecordStatus,
        gtrid: &GlobalTransactionId,
        unique_names: &BTreeSet<String>,
    ) -> JournalResult<()>;

    /// Forces every buffered record to stable storage.
    fn force(&self) -> JournalResult<()>;

    /// Reads every record of the active file in sequence order.
    fn read_all(&self) -> JournalResult<Vec<JournalRecord>>;

    /// Returns the transactions that are not yet terminal in the journal.
    fn collect_dangling(&self) -> JournalResult<BTreeMap<GlobalTransactionId, DanglingTransaction>> {
        Ok(collect_dangling(self.read_all()?))
    }

    /// Flushes and marks the journal as cleanly shut down. Further writes fail.
    fn close(&self) -> JournalResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalKind {
    #[default]
    Disk,
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub kind: JournalKind,
    pub part1_path: PathBuf,
    pub part2_path: PathBuf,
    /// Size of the active file that triggers a rotation.
    pub max_log_size_bytes: u64,
    /// Whether forced records are fsynced. Turning this off trades crash
    /// safety for latency.
    pub forced_write_enabled: bool,
    /// Only write the records recovery acts upon.
    pub filter_log_status: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            kind: JournalKind::Disk,
            part1_path: PathBuf::from("minitx-1.tlog"),
            part2_path: PathBuf::from("minitx-2.tlog"),
            max_log_size_bytes: 2 * 1024 * 1024,
            forced_write_enabled: true,
            filter_log_status: true,
        }
    }
}

impl JournalConfig {
    /// A disk journal whose two files live in `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            part1_path: dir.join("minitx-1.tlog"),
            part2_path: dir.join("minitx-2.tlog"),
            ..Default::default()
        }
    }
}

/// Opens the journal described by `config`.
pub fn open_journal(config: &JournalConfig) -> JournalResult<Arc<dyn TransactionJournal>> {
    match config.kind {
        JournalKind::Disk => Ok(Arc::new(DiskJournal::open(config)?)),
        JournalKind::Null => Ok(Arc::new(NullJournal::new())),
    }
}

#[cfg(test)]
pub(crate) fn test_gtrid(seq: u32) -> GlobalTransactionId {
    let mut bytes = b"test".to_vec();
    bytes.extend_from_slice(&[0u8; 16]);
    bytes.extend_from_slice(&seq.to_be_bytes());
    GlobalTransactionId::from_bytes(bytes).unwrap()
}
