//! Resolving in-doubt branches after a crash.
//!
//! A run matches the journal's dangling transactions against the branches
//! every resource reports as prepared. A branch is committed when the journal
//! holds a commit decision naming its resource, and rolled back otherwise
//! (presumed abort). Terminal records are appended once a transaction needs no
//! more work, so a second run over an unchanged system writes nothing.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_skiplist::SkipMap;
use minitx_common::{GlobalTransactionId, RecordStatus, UidGenerator, Xid};
use minitx_journal::{DanglingTransaction, TransactionJournal};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{ResourceError, RecoveryResult};
use crate::heuristic::{Decision, HeuristicReport};
use crate::resource::ResourceRef;
use crate::transaction::Transaction;

/// What one recovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: Vec<Xid>,
    pub rolled_back: Vec<Xid>,
    /// Branches whose heuristic outcome diverged from the decision.
    pub heuristics: usize,
    /// Resources whose `recover` failed. They are retried on the next run.
    pub failed_resources: Vec<String>,
    pub records_appended: usize,
    /// Branches left alone because their transaction is still running here.
    pub skipped_in_flight: usize,
}

impl RecoveryReport {
    /// True if the run neither completed a branch nor wrote to the journal.
    pub fn is_idle(&self) -> bool {
        self.committed.is_empty()
            && self.rolled_back.is_empty()
            && self.heuristics == 0
            && self.records_appended == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub executions: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_report: Option<RecoveryReport>,
    pub last_error: Option<String>,
}

/// Per-gtrid bookkeeping of one run.
#[derive(Debug, Default)]
struct Progress {
    /// Resources that reported a branch of the transaction.
    reported: BTreeSet<String>,
    /// Resources whose branch needs no more work.
    resolved: BTreeSet<String>,
}

enum BranchOutcome {
    Completed,
    Diverged,
    Failed,
}

/// State of this instance when the run started.
struct Snapshot<'a> {
    sequence: u32,
    in_flight: HashSet<GlobalTransactionId>,
    live: &'a SkipMap<GlobalTransactionId, Arc<Transaction>>,
}

pub struct Recoverer {
    journal: Arc<dyn TransactionJournal>,
    uid: Arc<UidGenerator>,
    heuristics: Arc<HeuristicReport>,
    retention: Duration,
    current_node_only: bool,
    stats: Mutex<RecoveryStats>,
    running: Mutex<()>,
}

impl Recoverer {
    pub fn new(
        journal: Arc<dyn TransactionJournal>,
        uid: Arc<UidGenerator>,
        heuristics: Arc<HeuristicReport>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            journal,
            uid,
            heuristics,
            retention: config.recovery_retention(),
            current_node_only: config.current_node_only_recovery,
            stats: Mutex::new(RecoveryStats::default()),
            running: Mutex::new(()),
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats.lock().clone()
    }

    /// Recovers the branches of `resources`. Runs are serialized.
    ///
    /// A full run covers every registered resource and also closes journal
    /// entries that never reached a commit decision. An incremental run covers
    /// a newly registered resource only.
    pub fn run(
        &self,
        resources: &[ResourceRef],
        in_flight: &SkipMap<GlobalTransactionId, Arc<Transaction>>,
        full: bool,
    ) -> RecoveryResult<RecoveryReport> {
        let _running = self.running.lock();
        let result = self.run_locked(resources, in_flight, full);

        let mut stats = self.stats.lock();
        stats.executions += 1;
        stats.last_run = Some(Utc::now());
        match &result {
            Ok(report) => {
                stats.last_report = Some(report.clone());
                stats.last_error = None;
            }
            Err(e) => {
                warn!(error = %e, "recovery failed");
                stats.last_error = Some(e.to_string());
            }
        }
        result
    }

    fn run_locked(
        &self,
        resources: &[ResourceRef],
        in_flight: &SkipMap<GlobalTransactionId, Arc<Transaction>>,
        full: bool,
    ) -> RecoveryResult<RecoveryReport> {
        // Taken before the journal scan: anything begun later is in flight.
        let snapshot = Snapshot {
            sequence: self.uid.current_sequence(),
            in_flight: in_flight.iter().map(|entry| entry.key().clone()).collect(),
            live: in_flight,
        };
        let dangling = self.journal.collect_dangling()?;
        debug!(dangling = dangling.len(), resources = resources.len(), full, "recovery started");

        let mut report = RecoveryReport::default();
        let mut progress: BTreeMap<GlobalTransactionId, Progress> = BTreeMap::new();
        let mut scanned = BTreeSet::new();

        for resource in resources {
            let name = resource.unique_name().to_string();
            let xids = match resource.recover() {
                Ok(xids) => xids,
                Err(e) => {
                    warn!(resource = %name, error = %e, "recovery scan failed");
                    report.failed_resources.push(name);
                    continue;
                }
            };
            scanned.insert(name.clone());

            for xid in xids {
                let gtrid = xid.gtrid().clone();
                if !xid.is_ours() {
                    debug!(resource = %name, %xid, "ignoring branch of a foreign format");
                    continue;
                }
                if self.current_node_only && !self.uid.is_same_server(&gtrid) {
                    debug!(resource = %name, %xid, "ignoring branch of another server");
                    continue;
                }
                if self.is_in_flight(&gtrid, &snapshot) {
                    report.skipped_in_flight += 1;
                    continue;
                }

                let commit = dangling
                    .get(&gtrid)
                    .is_some_and(|tx| tx.commit_decided && tx.pending.contains(&name));
                let decision = if commit {
                    Decision::Commit
                } else {
                    Decision::Rollback
                };
                let entry = progress.entry(gtrid).or_default();
                entry.reported.insert(name.clone());
                match self.complete(resource, &xid, decision) {
                    BranchOutcome::Completed => {
                        entry.resolved.insert(name.clone());
                        match decision {
                            Decision::Commit => report.committed.push(xid),
                            Decision::Rollback => report.rolled_back.push(xid),
                        }
                    }
                    BranchOutcome::Diverged => {
                        entry.resolved.insert(name.clone());
                        report.heuristics += 1;
                    }
                    BranchOutcome::Failed => {}
                }
            }
        }

        for (gtrid, tx) in &dangling {
            if self.is_in_flight(gtrid, &snapshot) {
                continue;
            }
            let progress = progress.get(gtrid);
            if tx.commit_decided {
                let names = self.committed_names(tx, progress, &scanned);
                if !names.is_empty() {
                    self.append(RecordStatus::StatusCommitted, gtrid, &names)?;
                    report.records_appended += 1;
                }
            } else if full && self.abandoned(tx, progress) {
                self.append(RecordStatus::StatusRolledback, gtrid, &tx.pending)?;
                report.records_appended += 1;
            }
        }

        if report.is_idle() {
            debug!(failed = report.failed_resources.len(), "recovery found nothing to do");
        } else {
            info!(
                committed = report.committed.len(),
                rolled_back = report.rolled_back.len(),
                heuristics = report.heuristics,
                records = report.records_appended,
                "recovery finished"
            );
        }
        Ok(report)
    }

    /// Returns true if this instance is running `gtrid` or began it after the
    /// run started.
    fn is_in_flight(&self, gtrid: &GlobalTransactionId, snapshot: &Snapshot<'_>) -> bool {
        self.uid.is_own(gtrid)
            && (snapshot.in_flight.contains(gtrid)
                || snapshot.live.contains_key(gtrid)
                || gtrid.sequence() >= snapshot.sequence)
    }

    fn complete(&self, resource: &ResourceRef, xid: &Xid, decision: Decision) -> BranchOutcome {
        let name = resource.unique_name();
        let result = match decision {
            Decision::Commit => resource.commit(xid, false),
            Decision::Rollback => resource.rollback(xid),
        };
        match result {
            Ok(()) => {
                debug!(resource = name, %xid, %decision, "recovered branch");
                BranchOutcome::Completed
            }
            Err(ResourceError::BranchUnknown) => {
                debug!(resource = name, %xid, "branch already completed");
                BranchOutcome::Completed
            }
            Err(ResourceError::Heuristic(outcome)) => {
                let diverged = !outcome.agrees_with(decision.is_commit());
                if diverged {
                    self.heuristics.record(xid.gtrid(), name, outcome, decision);
                }
                if let Err(e) = resource.forget(xid) {
                    warn!(resource = name, %xid, error = %e, "failed to forget heuristic branch");
                }
                if diverged {
                    BranchOutcome::Diverged
                } else {
                    BranchOutcome::Completed
                }
            }
            Err(e) => {
                warn!(resource = name, %xid, %decision, error = %e, "failed to recover branch, retrying on the next run");
                BranchOutcome::Failed
            }
        }
    }

    /// Names a `STATUS_COMMITTED` record can cover: resources that finished
    /// their branch in this run and, once the retention elapsed, scanned
    /// resources that no longer report one.
    fn committed_names(
        &self,
        tx: &DanglingTransaction,
        progress: Option<&Progress>,
        scanned: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = progress
            .map(|progress| progress.resolved.clone())
            .unwrap_or_default();
        if self.aged(tx) {
            names.extend(
                tx.pending
                    .iter()
                    .filter(|name| scanned.contains(*name))
                    .filter(|name| progress.is_none_or(|progress| !progress.reported.contains(*name)))
                    .cloned(),
            );
        }
        names.retain(|name| tx.pending.contains(name));
        names
    }

    /// An undecided transaction is closed once every branch that was found
    /// rolled back, or once the retention elapsed.
    fn abandoned(&self, tx: &DanglingTransaction, progress: Option<&Progress>) -> bool {
        let rolled_back = progress.is_some_and(|progress| {
            !progress.reported.is_empty() && progress.reported == progress.resolved
        });
        rolled_back || self.aged(tx)
    }

    fn aged(&self, tx: &DanglingTransaction) -> bool {
        let age = Utc::now().timestamp_millis().saturating_sub(tx.last_time);
        age >= 0 && age as u128 >= self.retention.as_millis()
    }

    fn append(
        &self,
        status: RecordStatus,
        gtrid: &GlobalTransactionId,
        names: &BTreeSet<String>,
    ) -> RecoveryResult<()> {
        self.journal.log(status, gtrid, names)?;
        debug!(%gtrid, %status, ?names, "recovery closed journal entry");
        Ok(())
    }
}
