use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use itertools::Itertools;
use minitx_common::{GlobalTransactionId, RecordStatus, Status, UidGenerator};
use minitx_journal::{TransactionJournal, open_journal};
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{
    ConfigError, CoordinatorError, CoordinatorResult, RecoveryError, TransactionError,
    TransactionResult,
};
use crate::executor::{PhaseExecutor, TwoPhaseCommitter};
use crate::heuristic::{HeuristicEntry, HeuristicReport};
use crate::recovery::{Recoverer, RecoveryReport, RecoveryStats};
use crate::resource::ResourceRef;
use crate::scheduler::{TaskKey, TaskScheduler, deadline_after};
use crate::transaction::{StatusListener, Transaction};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct CoordinatorInner {
    config: CoordinatorConfig,
    journal: Arc<dyn TransactionJournal>,
    scheduler: TaskScheduler,
    resources: DashMap<String, ResourceRef>,
    in_flight: SkipMap<GlobalTransactionId, Arc<Transaction>>,
    threads: DashMap<ThreadId, Arc<Transaction>>,
    uid: Arc<UidGenerator>,
    committer: TwoPhaseCommitter,
    recoverer: Recoverer,
    heuristics: Arc<HeuristicReport>,
    /// Timeout for new transactions in seconds; 0 means the configured default.
    timeout_override: AtomicU64,
    shutting_down: AtomicBool,
    journal_failed: Arc<AtomicBool>,
}

/// Handle to a transaction coordinator.
///
/// Cloning is cheap; every clone drives the same coordinator. Transactions are
/// associated with the thread that began or resumed them, and the
/// thread-bound operations act on the calling thread's transaction.
///
/// Dropping the last handle without [`shutdown`](Coordinator::shutdown) leaves
/// the journal marked unclean, exactly like a crash.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub fn open(config: CoordinatorConfig) -> CoordinatorResult<Self> {
        Self::open_with_resources(config, Vec::new())
    }

    /// Opens the journal, registers `resources` and recovers them before
    /// returning.
    pub fn open_with_resources(
        config: CoordinatorConfig,
        resources: Vec<ResourceRef>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        let journal = open_journal(&config.journal)?;
        Self::with_journal(config, journal, resources)
    }

    /// Like [`open_with_resources`](Coordinator::open_with_resources), on a
    /// journal opened by the caller.
    pub fn with_journal(
        config: CoordinatorConfig,
        journal: Arc<dyn TransactionJournal>,
        resources: Vec<ResourceRef>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        let uid = Arc::new(UidGenerator::new(&config.server_id).map_err(ConfigError::from)?);
        let heuristics = Arc::new(HeuristicReport::new());
        let journal_failed = Arc::new(AtomicBool::new(false));
        let committer = TwoPhaseCommitter::new(
            journal.clone(),
            PhaseExecutor::from_config(&config)?,
            heuristics.clone(),
            journal_failed.clone(),
            &config,
        );
        let recoverer = Recoverer::new(journal.clone(), uid.clone(), heuristics.clone(), &config);

        let registered = DashMap::new();
        for resource in resources {
            let name = resource.unique_name().to_string();
            if registered.insert(name.clone(), resource).is_some() {
                return Err(CoordinatorError::DuplicateResource(name));
            }
        }

        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                config,
                journal,
                scheduler: TaskScheduler::start().map_err(CoordinatorError::Spawn)?,
                resources: registered,
                in_flight: SkipMap::new(),
                threads: DashMap::new(),
                uid,
                committer,
                recoverer,
                heuristics,
                timeout_override: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                journal_failed,
            }),
        };

        let report = coordinator.recover_now()?;
        info!(
            server_id = %coordinator.inner.config.server_id,
            resources = coordinator.inner.resources.len(),
            recovered = report.committed.len() + report.rolled_back.len(),
            "transaction coordinator started"
        );
        coordinator.schedule_recovery();
        Ok(coordinator)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Begins a transaction and associates it with the calling thread.
    pub fn begin(&self) -> CoordinatorResult<Arc<Transaction>> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShuttingDown);
        }
        if inner.journal_failed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::JournalFailed);
        }
        let thread = thread::current().id();
        if let Some(current) = inner.threads.get(&thread) {
            return Err(TransactionError::AlreadyAssociated(current.gtrid().clone()).into());
        }

        let gtrid = inner.uid.next_gtrid().map_err(TransactionError::from)?;
        let tx = Arc::new(Transaction::new(
            gtrid.clone(),
            self.transaction_timeout(),
            inner.config.allow_last_resource_commit,
        ));
        tx.transition(Status::Active)?;
        if let Err(e) = inner
            .journal
            .log(RecordStatus::StatusActive, &gtrid, &BTreeSet::new())
        {
            inner.journal_failed.store(true, Ordering::SeqCst);
            error!(%gtrid, error = %e, "journal write failed, refusing new transactions");
            return Err(e.into());
        }

        inner.in_flight.insert(gtrid.clone(), tx.clone());
        inner.threads.insert(thread, tx.clone());
        let timed: Weak<Transaction> = Arc::downgrade(&tx);
        inner
            .scheduler
            .schedule(TaskKey::TransactionTimeout(gtrid.clone()), tx.deadline(), move || {
                if let Some(tx) = timed.upgrade() {
                    tx.mark_timed_out();
                }
            });
        debug!(%gtrid, timeout = ?tx.timeout(), "transaction begun");
        Ok(tx)
    }

    /// The transaction associated with the calling thread.
    pub fn current_transaction(&self) -> Option<Arc<Transaction>> {
        self.inner
            .threads
            .get(&thread::current().id())
            .map(|entry| entry.value().clone())
    }

    /// Status of the calling thread's transaction.
    pub fn status(&self) -> Status {
        self.current_transaction()
            .map_or(Status::NoTransaction, |tx| tx.status())
    }

    /// Commits the calling thread's transaction and dissociates it.
    pub fn commit(&self) -> TransactionResult<()> {
        let tx = self.take_current()?;
        let result = self.inner.committer.commit(&tx);
        self.finish(&tx);
        result
    }

    /// Rolls back the calling thread's transaction and dissociates it.
    pub fn rollback(&self) -> TransactionResult<()> {
        let tx = self.take_current()?;
        let result = self.inner.committer.rollback(&tx);
        self.finish(&tx);
        result
    }

    /// Commits `tx` from any thread. A thread still associated with `tx`
    /// loses the association.
    pub fn commit_transaction(&self, tx: &Arc<Transaction>) -> TransactionResult<()> {
        self.detach(tx)?;
        let result = self.inner.committer.commit(tx);
        self.finish(tx);
        result
    }

    /// Rolls back `tx` from any thread. A thread still associated with `tx`
    /// loses the association.
    pub fn rollback_transaction(&self, tx: &Arc<Transaction>) -> TransactionResult<()> {
        self.detach(tx)?;
        let result = self.inner.committer.rollback(tx);
        self.finish(tx);
        result
    }

    pub fn set_rollback_only(&self) -> TransactionResult<()> {
        self.current_transaction()
            .ok_or(TransactionError::NoTransaction)?
            .set_rollback_only()
    }

    /// Dissociates the calling thread's transaction and returns it.
    pub fn suspend(&self) -> TransactionResult<Arc<Transaction>> {
        let tx = self.take_current()?;
        debug!(gtrid = %tx.gtrid(), "transaction suspended");
        Ok(tx)
    }

    /// Associates `tx` with the calling thread.
    pub fn resume(&self, tx: Arc<Transaction>) -> TransactionResult<()> {
        if !self.inner.in_flight.contains_key(tx.gtrid()) {
            return Err(TransactionError::NotManaged(tx.gtrid().clone()));
        }
        match self.inner.threads.entry(thread::current().id()) {
            Entry::Occupied(current) => Err(TransactionError::AlreadyAssociated(
                current.get().gtrid().clone(),
            )),
            Entry::Vacant(slot) => {
                debug!(gtrid = %tx.gtrid(), "transaction resumed");
                slot.insert(tx);
                Ok(())
            }
        }
    }

    /// Sets the timeout of transactions begun from now on. Zero restores the
    /// configured default.
    pub fn set_transaction_timeout(&self, secs: u64) {
        self.inner.timeout_override.store(secs, Ordering::SeqCst);
    }

    pub fn transaction_timeout(&self) -> Duration {
        match self.inner.timeout_override.load(Ordering::SeqCst) {
            0 => self.inner.config.default_transaction_timeout(),
            secs => Duration::from_secs(secs),
        }
    }

    /// Registers a listener on the calling thread's transaction.
    pub fn register_status_listener(&self, listener: Arc<dyn StatusListener>) -> TransactionResult<()> {
        self.current_transaction()
            .ok_or(TransactionError::NoTransaction)?
            .register_listener(listener);
        Ok(())
    }

    /// Registers `resource` and recovers its in-doubt branches.
    ///
    /// A failing recovery is logged and retried by the next background run.
    pub fn register_resource(&self, resource: ResourceRef) -> CoordinatorResult<()> {
        let name = resource.unique_name().to_string();
        match self.inner.resources.entry(name.clone()) {
            Entry::Occupied(_) => return Err(CoordinatorError::DuplicateResource(name)),
            Entry::Vacant(slot) => {
                slot.insert(resource.clone());
            }
        }
        info!(resource = %name, "resource registered");
        if let Err(e) = self
            .inner
            .recoverer
            .run(&[resource], &self.inner.in_flight, false)
        {
            warn!(resource = %name, error = %e, "incremental recovery failed");
        }
        Ok(())
    }

    /// Unregisters a resource. Journal entries naming it stay open until it is
    /// registered again.
    pub fn unregister_resource(&self, unique_name: &str) -> Option<ResourceRef> {
        let removed = self.inner.resources.remove(unique_name).map(|(_, resource)| resource);
        if removed.is_some() {
            info!(resource = unique_name, "resource unregistered");
        }
        removed
    }

    /// The registered resources, ordered by name.
    pub fn resources(&self) -> Vec<ResourceRef> {
        self.inner
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .sorted_by(|a, b| a.unique_name().cmp(b.unique_name()))
            .collect()
    }

    /// Runs a full recovery over every registered resource.
    pub fn recover_now(&self) -> CoordinatorResult<RecoveryReport> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RecoveryError::ShuttingDown.into());
        }
        let report = self
            .inner
            .recoverer
            .run(&self.resources(), &self.inner.in_flight, true)?;
        Ok(report)
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.inner.recoverer.stats()
    }

    pub fn heuristic_report(&self) -> Vec<HeuristicEntry> {
        self.inner.heuristics.entries()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_journal_failed(&self) -> bool {
        self.inner.journal_failed.load(Ordering::SeqCst)
    }

    /// Refuses new transactions, waits up to the graceful interval for the
    /// running ones, stops background work and closes the journal.
    pub fn shutdown(&self) -> CoordinatorResult<()> {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(in_flight = inner.in_flight.len(), "transaction coordinator shutting down");

        let deadline = deadline_after(inner.config.graceful_shutdown_interval());
        while !inner.in_flight.is_empty() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        if !inner.in_flight.is_empty() {
            warn!(
                remaining = inner.in_flight.len(),
                "transactions still running at shutdown, leaving them to recovery"
            );
        }

        inner.scheduler.shutdown();
        inner.journal.close()?;
        info!("transaction coordinator stopped");
        Ok(())
    }

    fn take_current(&self) -> TransactionResult<Arc<Transaction>> {
        self.inner
            .threads
            .remove(&thread::current().id())
            .map(|(_, tx)| tx)
            .ok_or(TransactionError::NoTransaction)
    }

    fn detach(&self, tx: &Transaction) -> TransactionResult<()> {
        if !self.inner.in_flight.contains_key(tx.gtrid()) {
            return Err(TransactionError::NotManaged(tx.gtrid().clone()));
        }
        self.inner
            .threads
            .retain(|_, current| current.gtrid() != tx.gtrid());
        Ok(())
    }

    /// Stops tracking `tx` once it reached a final status.
    fn finish(&self, tx: &Transaction) {
        if !tx.status().is_terminal() {
            return;
        }
        self.inner.in_flight.remove(tx.gtrid());
        self.inner
            .scheduler
            .cancel(&TaskKey::TransactionTimeout(tx.gtrid().clone()));
    }

    fn schedule_recovery(&self) {
        let Some(interval) = self.inner.config.background_recovery_interval() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .schedule(TaskKey::Recovery, deadline_after(interval), move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let coordinator = Coordinator { inner };
                if let Err(e) = coordinator.recover_now() {
                    debug!(error = %e, "background recovery skipped");
                }
                coordinator.schedule_recovery();
            });
    }
}

#[cfg(test)]
mod tests {
    use minitx_journal::JournalKind;

    use super::*;

    fn config() -> CoordinatorConfig {
        let mut config = CoordinatorConfig {
            server_id: "unit".into(),
            background_recovery_interval_secs: 0,
            graceful_shutdown_interval_secs: 0,
            ..Default::default()
        };
        config.journal.kind = JournalKind::Null;
        config
    }

    #[test]
    fn test_begin_associates_thread() {
        let coordinator = Coordinator::open(config()).unwrap();
        assert_eq!(coordinator.status(), Status::NoTransaction);
        let tx = coordinator.begin().unwrap();
        assert_eq!(coordinator.status(), Status::Active);
        assert_eq!(
            coordinator.current_transaction().unwrap().gtrid(),
            tx.gtrid()
        );
        assert!(matches!(
            coordinator.begin(),
            Err(CoordinatorError::Transaction(
                TransactionError::AlreadyAssociated(_)
            ))
        ));
        coordinator.commit().unwrap();
        assert_eq!(tx.status(), Status::Committed);
        assert_eq!(coordinator.in_flight_count(), 0);
        assert!(matches!(
            coordinator.commit(),
            Err(TransactionError::NoTransaction)
        ));
    }

    #[test]
    fn test_transaction_timeout_override() {
        let coordinator = Coordinator::open(config()).unwrap();
        assert_eq!(coordinator.transaction_timeout(), Duration::from_secs(60));
        coordinator.set_transaction_timeout(5);
        assert_eq!(coordinator.begin().unwrap().timeout(), Duration::from_secs(5));
        coordinator.rollback().unwrap();
        coordinator.set_transaction_timeout(0);
        assert_eq!(coordinator.transaction_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_transaction_timeout_is_clamped() {
        let coordinator = Coordinator::open(config()).unwrap();
        coordinator.set_transaction_timeout(u64::MAX);
        let tx = coordinator.begin().unwrap();
        assert_eq!(tx.timeout(), Duration::from_secs(u64::MAX));
        assert!(tx.deadline() > Instant::now() + Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(tx.status(), Status::Active);
        coordinator.commit().unwrap();
        assert_eq!(tx.status(), Status::Committed);
    }

    #[test]
    fn test_huge_recovery_interval_is_refused() {
        let mut config = config();
        config.background_recovery_interval_secs = u64::MAX;
        assert!(matches!(
            Coordinator::open(config),
            Err(CoordinatorError::Config(ConfigError::TooLarge { .. }))
        ));
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let coordinator = Coordinator::open(config()).unwrap();
        coordinator.shutdown().unwrap();
        coordinator.shutdown().unwrap();
        assert!(matches!(
            coordinator.begin(),
            Err(CoordinatorError::ShuttingDown)
        ));
        assert!(matches!(
            coordinator.recover_now(),
            Err(CoordinatorError::Recovery(RecoveryError::ShuttingDown))
        ));
    }
}
