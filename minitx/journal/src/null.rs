use std::collections::BTreeSet;

use minitx_common::{GlobalTransactionId, RecordStatus};
use tracing::trace;

use crate::TransactionJournal;
use crate::error::JournalResult;
use crate::record::JournalRecord;

/// A journal that drops every record. Nothing survives a crash.
#[derive(Debug, Default)]
pub struct NullJournal;

impl NullJournal {
    pub fn new() -> Self {
        Self
    }
}

impl TransactionJournal for NullJournal {
    fn log(
        &self,
        status: RecordStatus,
        gtrid: &GlobalTransactionId,
        _unique_names: &BTreeSet<String>,
    ) -> JournalResult<()> {
        trace!(%gtrid, %status, "dropping journal record");
        Ok(())
    }

    fn force(&self) -> JournalResult<()> {
        Ok(())
    }

    fn read_all(&self) -> JournalResult<Vec<JournalRecord>> {
        Ok(Vec::new())
    }

    fn close(&self) -> JournalResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_gtrid;

    #[test]
    fn test_null_journal_keeps_nothing() {
        let journal = NullJournal::new();
        let names = ["a".to_string()].into();
        journal
            .log(RecordStatus::StatusPrepared, &test_gtrid(1), &names)
            .unwrap();
        journal.force().unwrap();
        assert!(journal.read_all().unwrap().is_empty());
        assert!(journal.collect_dangling().unwrap().is_empty());
    }
}
