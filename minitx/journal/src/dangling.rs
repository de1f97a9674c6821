//! Folding journal records into the set of transactions that are still open.

use std::collections::{BTreeMap, BTreeSet};

use minitx_common::{GlobalTransactionId, RecordStatus};

use crate::record::JournalRecord;

/// A global transaction the journal does not yet show as terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingTransaction {
    pub gtrid: GlobalTransactionId,
    /// True if a `STATUS_PREPARED` or `STATUS_COMMITTING` record was written.
    pub commit_decided: bool,
    /// Resource names not yet covered by a terminal record.
    pub pending: BTreeSet<String>,
    /// Time of the most recent record, milliseconds since the unix epoch.
    pub last_time: i64,
    /// Every record of this transaction, in sequence order.
    pub records: Vec<JournalRecord>,
}

impl DanglingTransaction {
    fn new(gtrid: GlobalTransactionId) -> Self {
        Self {
            gtrid,
            commit_decided: false,
            pending: BTreeSet::new(),
            last_time: 0,
            records: Vec::new(),
        }
    }

    /// The status of the latest record.
    pub fn last_status(&self) -> Option<RecordStatus> {
        self.records.last().map(|record| record.status)
    }
}

#[derive(Debug)]
struct Fold {
    tx: DanglingTransaction,
    terminal_seen: bool,
}

/// Folds `records` and returns the transactions that are still open, keyed by
/// gtrid.
///
/// A transaction is open until a terminal record was written for it and every
/// resource name listed by its non-terminal records is covered by a terminal
/// record. A commit that finished on some resources only therefore stays open
/// for the remaining ones.
pub fn collect_dangling<I>(records: I) -> BTreeMap<GlobalTransactionId, DanglingTransaction>
where
    I: IntoIterator<Item = JournalRecord>,
{
    let mut sorted: Vec<JournalRecord> = records.into_iter().collect();
    sorted.sort_by_key(|record| record.sequence);

    let mut folds: BTreeMap<GlobalTransactionId, Fold> = BTreeMap::new();
    for record in sorted {
        let fold = folds
            .entry(record.gtrid.clone())
            .or_insert_with(|| Fold {
                tx: DanglingTransaction::new(record.gtrid.clone()),
                terminal_seen: false,
            });

        if record.status.is_terminal() {
            fold.terminal_seen = true;
            for name in &record.unique_names {
                fold.tx.pending.remove(name);
            }
        } else {
            if record.status.is_commit_decision() {
                fold.tx.commit_decided = true;
            }
            fold.tx.pending.extend(record.unique_names.iter().cloned());
        }
        fold.tx.last_time = fold.tx.last_time.max(record.time);
        fold.tx.records.push(record);
    }

    folds
        .into_iter()
        .filter(|(_, fold)| !fold.terminal_seen || !fold.tx.pending.is_empty())
        .map(|(gtrid, fold)| (gtrid, fold.tx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_gtrid;

    struct Log {
        next: u64,
        records: Vec<JournalRecord>,
    }

    impl Log {
        fn new() -> Self {
            Self {
                next: 1,
                records: Vec::new(),
            }
        }

        fn push(&mut self, tx: u32, status: RecordStatus, names: &[&str]) -> &mut Self {
            self.records.push(JournalRecord {
                status,
                gtrid: test_gtrid(tx),
                unique_names: names.iter().map(|n| n.to_string()).collect(),
                sequence: self.next,
                time: self.next as i64 * 10,
            });
            self.next += 1;
            self
        }
    }

    #[test]
    fn test_committed_transaction_is_closed() {
        let mut log = Log::new();
        log.push(1, RecordStatus::StatusPrepared, &["a", "b"])
            .push(1, RecordStatus::StatusCommitted, &["a", "b"]);
        assert!(collect_dangling(log.records.clone()).is_empty());
    }

    #[test]
    fn test_prepared_without_terminal_is_dangling() {
        let mut log = Log::new();
        log.push(1, RecordStatus::StatusPrepared, &["a", "b"])
            .push(2, RecordStatus::StatusRolledback, &["c"]);
        let dangling = collect_dangling(log.records.clone());
        assert_eq!(dangling.len(), 1);

        let tx = &dangling[&test_gtrid(1)];
        assert!(tx.commit_decided);
        assert_eq!(tx.pending, ["a", "b"].map(String::from).into());
        assert_eq!(tx.last_status(), Some(RecordStatus::StatusPrepared));
    }

    #[test]
    fn test_partial_commit_stays_open_for_the_rest() {
        let mut log = Log::new();
        log.push(1, RecordStatus::StatusPrepared, &["a", "b"])
            .push(1, RecordStatus::StatusCommitted, &["a"])
            .push(1, RecordStatus::StatusUnknown, &["b"]);
        let dangling = collect_dangling(log.records.clone());
        let tx = &dangling[&test_gtrid(1)];
        assert_eq!(tx.pending, ["b"].map(String::from).into());
        assert_eq!(tx.records.len(), 3);
        assert_eq!(tx.last_time, 30);
    }

    #[test]
    fn test_active_only_is_undecided() {
        let mut log = Log::new();
        log.push(4, RecordStatus::StatusActive, &[]);
        let dangling = collect_dangling(log.records.clone());
        let tx = &dangling[&test_gtrid(4)];
        assert!(!tx.commit_decided);
        assert!(tx.pending.is_empty());
    }

    #[test]
    fn test_records_are_folded_in_sequence_order() {
        let mut log = Log::new();
        log.push(1, RecordStatus::StatusPrepared, &["a"])
            .push(1, RecordStatus::StatusCommitted, &["a"]);
        let mut reversed = log.records.clone();
        reversed.reverse();
        assert!(collect_dangling(reversed).is_empty());
    }
}
