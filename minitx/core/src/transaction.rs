//! The transaction state machine.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use minitx_common::{GlobalTransactionId, Status};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{TransactionError, TransactionResult};
use crate::resource::{BranchState, ResourceRef, ResourceRegistry};
use crate::scheduler::deadline_after;

/// Observer of the status changes of one transaction.
///
/// Listeners run synchronously on the thread driving the transaction, in
/// registration order. A listener that blocks stalls the transaction.
pub trait StatusListener: Send + Sync {
    /// Called before the status changes. Returning an error vetoes the change
    /// while nothing about the outcome is decided, that is when the
    /// transaction leaves `ACTIVE` for `MARKED_ROLLBACK`, `PREPARING` or
    /// `COMMITTING`; the transaction then stays `ACTIVE`. Vetoes of a rollback
    /// and of every later change are logged and ignored.
    fn before_status_change(
        &self,
        gtrid: &GlobalTransactionId,
        from: Status,
        to: Status,
    ) -> Result<(), String> {
        let _ = (gtrid, from, to);
        Ok(())
    }

    fn after_status_change(&self, gtrid: &GlobalTransactionId, from: Status, to: Status) {
        let _ = (gtrid, from, to);
    }
}

pub struct Transaction {
    gtrid: GlobalTransactionId,
    created_at: DateTime<Utc>,
    timeout: Duration,
    deadline: Instant,
    allow_last_resource: bool,
    status: Mutex<Status>,
    registry: Mutex<ResourceRegistry>,
    listeners: RwLock<Vec<Arc<dyn StatusListener>>>,
}

impl Transaction {
    pub(crate) fn new(
        gtrid: GlobalTransactionId,
        timeout: Duration,
        allow_last_resource: bool,
    ) -> Self {
        Self {
            gtrid,
            created_at: Utc::now(),
            timeout,
            deadline: deadline_after(timeout),
            allow_last_resource,
            status: Mutex::new(Status::NoTransaction),
            registry: Mutex::new(ResourceRegistry::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn gtrid(&self) -> &GlobalTransactionId {
        &self.gtrid
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn register_listener(&self, listener: Arc<dyn StatusListener>) {
        self.listeners.write().push(listener);
    }

    /// Enlists `resource`. Returns false if it is already enlisted and its
    /// branch is still active.
    pub fn enlist(&self, resource: ResourceRef) -> TransactionResult<bool> {
        let status = self.status();
        if !status.is_active() {
            return Err(TransactionError::EnlistmentRefused {
                gtrid: self.gtrid.clone(),
                resource: resource.unique_name().to_string(),
                reason: format!("transaction is {status}"),
            });
        }
        self.registry
            .lock()
            .enlist(&self.gtrid, resource, self.allow_last_resource)
    }

    /// Names and states of the branches, in enlistment order.
    pub fn branch_states(&self) -> Vec<(String, BranchState)> {
        self.registry
            .lock()
            .branches()
            .iter()
            .map(|branch| (branch.unique_name().to_string(), branch.state()))
            .collect()
    }

    /// Makes rollback the only possible outcome.
    pub fn set_rollback_only(&self) -> TransactionResult<()> {
        match self.status() {
            Status::MarkedRollback => Ok(()),
            _ => self.transition(Status::MarkedRollback),
        }
    }

    /// Marks the transaction rollback-only if it is still active. Called when
    /// its deadline passes.
    pub(crate) fn mark_timed_out(&self) -> bool {
        if self.status() != Status::Active {
            return false;
        }
        match self.transition(Status::MarkedRollback) {
            Ok(()) => {
                warn!(gtrid = %self.gtrid, timeout = ?self.timeout, "transaction timed out, marked rollback-only");
                true
            }
            Err(TransactionError::ListenerVeto { reason, .. }) => {
                warn!(gtrid = %self.gtrid, %reason, "listener vetoed marking a timed-out transaction");
                false
            }
            Err(e) => {
                debug!(gtrid = %self.gtrid, error = %e, "timeout lost the race against completion");
                false
            }
        }
    }

    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, ResourceRegistry> {
        self.registry.lock()
    }

    /// Moves the transaction to `to`, firing the listeners around the change.
    ///
    /// The change only happens if the status did not move while the before
    /// listeners ran; otherwise [`TransactionError::IllegalState`] reports the
    /// status found.
    pub(crate) fn transition(&self, to: Status) -> TransactionResult<()> {
        let from = self.status();
        if !from.can_transition_to(to) {
            return Err(self.illegal(from, to));
        }
        let honor_veto = from == Status::Active
            && matches!(
                to,
                Status::MarkedRollback | Status::Preparing | Status::Committing
            );

        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in &listeners {
            if let Err(reason) = listener.before_status_change(&self.gtrid, from, to) {
                if honor_veto {
                    return Err(TransactionError::ListenerVeto {
                        gtrid: self.gtrid.clone(),
                        to,
                        reason,
                    });
                }
                warn!(gtrid = %self.gtrid, %from, %to, %reason, "ignoring listener veto");
            }
        }

        {
            let mut status = self.status.lock();
            if *status != from {
                return Err(self.illegal(*status, to));
            }
            *status = to;
        }
        debug!(gtrid = %self.gtrid, %from, %to, "status changed");

        for listener in &listeners {
            listener.after_status_change(&self.gtrid, from, to);
        }
        Ok(())
    }

    fn illegal(&self, from: Status, to: Status) -> TransactionError {
        TransactionError::IllegalState {
            gtrid: self.gtrid.clone(),
            from,
            to,
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("gtrid", &self.gtrid)
            .field("status", &self.status())
            .field("created_at", &self.created_at)
            .field("timeout", &self.timeout)
            .finish()
    }
}
