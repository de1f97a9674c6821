//! Two-phase commit of one transaction.
//!
//! # Protocol
//!
//! ## Phase 1: PREPARE
//! - Every branch is ended in enlistment order.
//! - Every branch except a last resource votes. Read-only voters drop out.
//! - Any failure rolls back every branch.
//! - A last resource is committed in one phase once all votes are in.
//! - `STATUS_PREPARED` with the names of the yes-voters is forced to the
//!   journal. From here on the transaction commits.
//!
//! ## Phase 2: COMMIT
//! - Every prepared branch is committed. A branch that fails is left to
//!   recovery; the others are committed regardless.
//! - `STATUS_COMMITTED` lists the branches that need no further work.
//!
//! A single branch skips the vote and commits in one phase.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use itertools::Itertools;
use minitx_common::{GlobalTransactionId, HeuristicOutcome, RecordStatus, Status, Xid};
use minitx_journal::{JournalError, TransactionJournal};
use tracing::{debug, error, warn};

use super::{BranchCall, PhaseExecutor};
use crate::config::CoordinatorConfig;
use crate::error::{ResourceError, ResourceResult, TransactionError, TransactionResult};
use crate::heuristic::{Decision, HeuristicReport};
use crate::resource::{BranchState, ResourceBranch, ResourceManager, ResourceRegistry, Vote};
use crate::transaction::Transaction;

type BranchOp<T> = fn(&dyn ResourceManager, &Xid) -> ResourceResult<T>;

/// States of branches that still hold work at the resource manager.
const ROLLBACK_CANDIDATES: [BranchState; 4] = [
    BranchState::Active,
    BranchState::Ended,
    BranchState::Prepared,
    BranchState::Failed,
];

pub struct TwoPhaseCommitter {
    journal: Arc<dyn TransactionJournal>,
    executor: PhaseExecutor,
    heuristics: Arc<HeuristicReport>,
    journal_failed: Arc<AtomicBool>,
    one_phase_optimization: bool,
    warn_about_zero_resource: bool,
}

impl TwoPhaseCommitter {
    pub fn new(
        journal: Arc<dyn TransactionJournal>,
        executor: PhaseExecutor,
        heuristics: Arc<HeuristicReport>,
        journal_failed: Arc<AtomicBool>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            journal,
            executor,
            heuristics,
            journal_failed,
            one_phase_optimization: config.one_phase_commit_optimization,
            warn_about_zero_resource: config.warn_about_zero_resource_transaction,
        }
    }

    /// Commits `tx`, which must be `ACTIVE` or `MARKED_ROLLBACK`.
    ///
    /// Returns [`TransactionError::RolledBack`] or
    /// [`TransactionError::RollbackOnly`] if the transaction was rolled back
    /// instead, and [`TransactionError::Heuristic`] if the outcome of some
    /// branch is not the decided one or not known yet.
    pub fn commit(&self, tx: &Transaction) -> TransactionResult<()> {
        let mut registry = tx.lock_registry();
        let one_phase =
            registry.is_empty() || (self.one_phase_optimization && registry.len() == 1);
        let first = if one_phase {
            Status::Committing
        } else {
            Status::Preparing
        };

        if let Err(e) = tx.transition(first) {
            return match e {
                TransactionError::ListenerVeto { reason, .. } => self.abort(
                    tx,
                    &mut registry,
                    format!("listener vetoed completion: {reason}"),
                ),
                TransactionError::IllegalState {
                    from: Status::MarkedRollback,
                    ..
                } => {
                    self.roll_back_locked(tx, &mut registry)?;
                    Err(TransactionError::RollbackOnly(tx.gtrid().clone()))
                }
                other => Err(other),
            };
        }

        if registry.is_empty() {
            if self.warn_about_zero_resource {
                warn!(gtrid = %tx.gtrid(), "committing a transaction without enlisted resources");
            }
            return tx.transition(Status::Committed);
        }
        if one_phase {
            return self.commit_one_phase(tx, &mut registry);
        }
        self.commit_two_phase(tx, &mut registry)
    }

    /// Rolls back `tx`, which must not have started completing.
    pub fn rollback(&self, tx: &Transaction) -> TransactionResult<()> {
        let mut registry = tx.lock_registry();
        self.roll_back_locked(tx, &mut registry)
    }

    fn commit_one_phase(
        &self,
        tx: &Transaction,
        registry: &mut ResourceRegistry,
    ) -> TransactionResult<()> {
        let gtrid = tx.gtrid().clone();
        if let Err(reason) = self.end_branches(&gtrid, registry) {
            return self.abort(tx, registry, reason);
        }

        let name = registry.branches()[0].unique_name().to_string();
        let result = self
            .executor
            .run_one(call_on(registry, 0, |rm, xid| rm.commit(xid, true)));
        let reported_commit = matches!(
            result,
            Err(ResourceError::Heuristic(HeuristicOutcome::Commit))
        );
        match result {
            Ok(()) | Err(ResourceError::Heuristic(HeuristicOutcome::Commit)) => {
                if reported_commit {
                    self.forget(&gtrid, &registry.branches()[0]);
                }
                registry.branches_mut()[0].set_state(BranchState::OnePhaseCommitted);
                self.log_outcome(RecordStatus::StatusCommitted, &gtrid, &[name].into());
                debug!(%gtrid, "transaction committed in one phase");
                tx.transition(Status::Committed)
            }
            Err(ResourceError::Heuristic(outcome)) => {
                self.report_heuristic(&gtrid, &registry.branches()[0], outcome, Decision::Commit);
                registry.branches_mut()[0].set_state(BranchState::Failed);
                tx.transition(Status::Unknown)?;
                Err(TransactionError::Heuristic { gtrid, outcome })
            }
            Err(ResourceError::Timeout(timeout)) => {
                warn!(%gtrid, resource = %name, ?timeout, "one-phase commit did not return, outcome unknown");
                registry.branches_mut()[0].set_state(BranchState::Failed);
                tx.transition(Status::Unknown)?;
                Err(TransactionError::Heuristic {
                    gtrid,
                    outcome: HeuristicOutcome::Hazard,
                })
            }
            Err(e) => {
                registry.branches_mut()[0].set_state(BranchState::Failed);
                self.abort(
                    tx,
                    registry,
                    format!("one-phase commit of {name} failed: {e}"),
                )
            }
        }
    }

    fn commit_two_phase(
        &self,
        tx: &Transaction,
        registry: &mut ResourceRegistry,
    ) -> TransactionResult<()> {
        let gtrid = tx.gtrid().clone();
        if let Err(reason) = self.end_branches(&gtrid, registry) {
            return self.abort(tx, registry, reason);
        }

        let (last, voters): (Vec<usize>, Vec<usize>) = (0..registry.len())
            .partition(|&index| registry.branches()[index].is_last_resource());

        let votes = self
            .executor
            .run_all(calls_on(registry, &voters, |rm, xid| rm.prepare(xid)));
        let mut failure = None;
        for (&index, vote) in voters.iter().zip(votes) {
            let branch = &mut registry.branches_mut()[index];
            match vote {
                Ok(Vote::Commit) => branch.set_state(BranchState::Prepared),
                Ok(Vote::ReadOnly) => {
                    debug!(%gtrid, resource = branch.unique_name(), "branch voted read-only");
                    branch.set_state(BranchState::Unused);
                }
                Err(e) => {
                    warn!(%gtrid, resource = branch.unique_name(), error = %e, "prepare failed");
                    branch.set_state(BranchState::Failed);
                    failure.get_or_insert_with(|| {
                        format!("prepare of {} failed: {e}", branch.unique_name())
                    });
                }
            }
        }
        if let Some(reason) = failure {
            return self.abort(tx, registry, reason);
        }

        let mut decided = registry.names_in(&[BranchState::Prepared]);
        if let Some(&index) = last.first() {
            let name = registry.branches()[index].unique_name().to_string();
            let result = self
                .executor
                .run_one(call_on(registry, index, |rm, xid| rm.commit(xid, true)));
            match result {
                Ok(()) => {}
                Err(ResourceError::Heuristic(HeuristicOutcome::Commit)) => {
                    self.forget(&gtrid, &registry.branches()[index]);
                }
                Err(e) => {
                    if let ResourceError::Heuristic(outcome) = e {
                        self.report_heuristic(
                            &gtrid,
                            &registry.branches()[index],
                            outcome,
                            Decision::Commit,
                        );
                    }
                    registry.branches_mut()[index].set_state(BranchState::Failed);
                    return self.abort(
                        tx,
                        registry,
                        format!("last resource {name} failed to commit: {e}"),
                    );
                }
            }
            registry.branches_mut()[index].set_state(BranchState::OnePhaseCommitted);
            decided.insert(name);
        }

        if decided.is_empty() {
            debug!(%gtrid, "every branch voted read-only");
            return tx.transition(Status::Committed);
        }

        // The durability point: from here on the transaction commits.
        if let Err(e) = self
            .journal
            .log(RecordStatus::StatusPrepared, &gtrid, &decided)
        {
            self.latch_journal_failure(&gtrid, RecordStatus::StatusPrepared, &e);
            return self.abort(tx, registry, format!("journal failure: {e}"));
        }
        tx.transition(Status::Prepared)?;
        tx.transition(Status::Committing)?;
        self.log_outcome(RecordStatus::StatusCommitting, &gtrid, &decided);

        let to_commit: Vec<usize> = (0..registry.len())
            .filter(|&index| registry.branches()[index].state() == BranchState::Prepared)
            .collect();
        let results = self
            .executor
            .run_all(calls_on(registry, &to_commit, |rm, xid| rm.commit(xid, false)));

        let mut resolved = registry.names_in(&[BranchState::OnePhaseCommitted]);
        let mut unresolved = BTreeSet::new();
        let mut diverged = Vec::new();
        for (&index, result) in to_commit.iter().zip(results) {
            let name = registry.branches()[index].unique_name().to_string();
            let state = match result {
                Ok(()) => BranchState::Committed,
                Err(ResourceError::BranchUnknown) => {
                    debug!(%gtrid, resource = %name, "branch already committed");
                    BranchState::Committed
                }
                Err(ResourceError::Heuristic(outcome)) => {
                    let branch = &registry.branches()[index];
                    if self.report_heuristic(&gtrid, branch, outcome, Decision::Commit) {
                        diverged.push(outcome);
                        BranchState::Failed
                    } else {
                        BranchState::Committed
                    }
                }
                Err(e) => {
                    warn!(%gtrid, resource = %name, error = %e, "commit failed, leaving branch to recovery");
                    unresolved.insert(name);
                    continue;
                }
            };
            registry.branches_mut()[index].set_state(state);
            resolved.insert(name);
        }

        self.log_outcome(RecordStatus::StatusCommitted, &gtrid, &resolved);
        if diverged.is_empty() && unresolved.is_empty() {
            debug!(%gtrid, branches = registry.len(), "transaction committed");
            return tx.transition(Status::Committed);
        }

        self.log_outcome(RecordStatus::StatusUnknown, &gtrid, &unresolved);
        let outcome = if unresolved.is_empty() {
            let committed_any = !registry
                .names_in(&[BranchState::Committed, BranchState::OnePhaseCommitted])
                .is_empty();
            summarize(committed_any, &diverged)
        } else {
            HeuristicOutcome::Hazard
        };
        tx.transition(Status::Unknown)?;
        Err(TransactionError::Heuristic { gtrid, outcome })
    }

    /// Rolls the transaction back and reports it as rolled back for `reason`.
    fn abort(
        &self,
        tx: &Transaction,
        registry: &mut ResourceRegistry,
        reason: String,
    ) -> TransactionResult<()> {
        warn!(gtrid = %tx.gtrid(), %reason, "rolling back transaction");
        self.roll_back_locked(tx, registry)?;
        Err(TransactionError::RolledBack {
            gtrid: tx.gtrid().clone(),
            reason,
        })
    }

    fn roll_back_locked(
        &self,
        tx: &Transaction,
        registry: &mut ResourceRegistry,
    ) -> TransactionResult<()> {
        let gtrid = tx.gtrid().clone();
        tx.transition(Status::RollingBack)?;
        if let Err(reason) = self.end_branches(&gtrid, registry) {
            debug!(%gtrid, %reason, "rolling back despite failed end");
        }

        let mut diverged = Vec::new();
        for branch in registry.branches() {
            if branch.state() == BranchState::OnePhaseCommitted {
                self.heuristics.record(
                    &gtrid,
                    branch.unique_name(),
                    HeuristicOutcome::Commit,
                    Decision::Rollback,
                );
                diverged.push(HeuristicOutcome::Commit);
            }
        }

        let targets: Vec<usize> = (0..registry.len())
            .filter(|&index| ROLLBACK_CANDIDATES.contains(&registry.branches()[index].state()))
            .collect();
        let results = self
            .executor
            .run_all(calls_on(registry, &targets, |rm, xid| rm.rollback(xid)));

        let mut resolved = BTreeSet::new();
        let mut clean = false;
        for (&index, result) in targets.iter().zip(results) {
            let name = registry.branches()[index].unique_name().to_string();
            let state = match result {
                Ok(()) | Err(ResourceError::BranchUnknown) => {
                    clean = true;
                    BranchState::RolledBack
                }
                Err(ResourceError::Heuristic(outcome)) => {
                    let branch = &registry.branches()[index];
                    if self.report_heuristic(&gtrid, branch, outcome, Decision::Rollback) {
                        diverged.push(outcome);
                        BranchState::Failed
                    } else {
                        BranchState::RolledBack
                    }
                }
                Err(e) => {
                    warn!(%gtrid, resource = %name, error = %e, "rollback failed, leaving branch to recovery");
                    registry.branches_mut()[index].set_state(BranchState::Failed);
                    continue;
                }
            };
            registry.branches_mut()[index].set_state(state);
            resolved.insert(name);
        }
        self.log_outcome(RecordStatus::StatusRolledback, &gtrid, &resolved);

        if diverged.is_empty() {
            debug!(%gtrid, "transaction rolled back");
            return tx.transition(Status::RolledBack);
        }
        let outcome = summarize(clean, &diverged);
        tx.transition(Status::Unknown)?;
        Err(TransactionError::Heuristic { gtrid, outcome })
    }

    /// Ends every active branch in enlistment order and returns the first
    /// failure.
    fn end_branches(
        &self,
        gtrid: &GlobalTransactionId,
        registry: &mut ResourceRegistry,
    ) -> Result<(), String> {
        let mut failure = None;
        for branch in registry.branches_mut() {
            if branch.state() != BranchState::Active {
                continue;
            }
            match branch.resource().end(branch.xid()) {
                Ok(()) => branch.set_state(BranchState::Ended),
                Err(e) => {
                    warn!(%gtrid, resource = branch.unique_name(), error = %e, "failed to end branch");
                    branch.set_state(BranchState::Failed);
                    failure.get_or_insert_with(|| {
                        format!("end of {} failed: {e}", branch.unique_name())
                    });
                }
            }
        }
        match failure {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Reports `outcome` if it diverges from `decision` and tells the resource
    /// to forget the branch. Returns true if it diverged.
    fn report_heuristic(
        &self,
        gtrid: &GlobalTransactionId,
        branch: &ResourceBranch,
        outcome: HeuristicOutcome,
        decision: Decision,
    ) -> bool {
        let diverged = !outcome.agrees_with(decision.is_commit());
        if diverged {
            self.heuristics
                .record(gtrid, branch.unique_name(), outcome, decision);
        }
        self.forget(gtrid, branch);
        diverged
    }

    fn forget(&self, gtrid: &GlobalTransactionId, branch: &ResourceBranch) {
        if let Err(e) = branch.resource().forget(branch.xid()) {
            warn!(%gtrid, resource = branch.unique_name(), error = %e, "failed to forget heuristic branch");
        }
    }

    /// Writes a record whose loss recovery can cope with. A failure only
    /// latches the journal as failed.
    fn log_outcome(&self, status: RecordStatus, gtrid: &GlobalTransactionId, names: &BTreeSet<String>) {
        if names.is_empty() {
            return;
        }
        if let Err(e) = self.journal.log(status, gtrid, names) {
            self.latch_journal_failure(gtrid, status, &e);
        }
    }

    fn latch_journal_failure(&self, gtrid: &GlobalTransactionId, status: RecordStatus, e: &JournalError) {
        self.journal_failed.store(true, Ordering::SeqCst);
        error!(%gtrid, %status, error = %e, "journal write failed, refusing new transactions");
    }
}

fn call_on<T: Send + 'static>(registry: &ResourceRegistry, index: usize, op: BranchOp<T>) -> BranchCall<T> {
    let branch = &registry.branches()[index];
    let resource = branch.resource().clone();
    let xid = branch.xid().clone();
    Box::new(move || op(resource.as_ref(), &xid))
}

fn calls_on<T: Send + 'static>(
    registry: &ResourceRegistry,
    indices: &[usize],
    op: BranchOp<T>,
) -> Vec<BranchCall<T>> {
    indices
        .iter()
        .map(|&index| call_on(registry, index, op))
        .collect()
}

/// Combines heuristic outcomes. `clean` tells whether some branch followed
/// the decision.
fn summarize(clean: bool, diverged: &[HeuristicOutcome]) -> HeuristicOutcome {
    if diverged.contains(&HeuristicOutcome::Hazard) {
        return HeuristicOutcome::Hazard;
    }
    match diverged.first() {
        Some(&first) if !clean && diverged.iter().all_equal() => first,
        _ => HeuristicOutcome::Mixed,
    }
}
