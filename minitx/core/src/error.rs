use std::path::PathBuf;
use std::time::Duration;

use minitx_common::{GlobalTransactionId, HeuristicOutcome, Status, UidError};
use minitx_journal::JournalError;
use thiserror::Error;

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),
    #[error("coordinator is shutting down")]
    ShuttingDown,
    #[error("journal failed earlier, refusing new transactions")]
    JournalFailed,
    #[error("resource {0} is already registered")]
    DuplicateResource(String),
    #[error("global coordinator is already initialized")]
    AlreadyInitialized,
    #[error("failed to build branch worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(std::io::Error),
}

pub type TransactionResult<T> = Result<T, TransactionError>;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {0} is marked rollback-only and was rolled back")]
    RollbackOnly(GlobalTransactionId),
    #[error("transaction {gtrid} rolled back: {reason}")]
    RolledBack {
        gtrid: GlobalTransactionId,
        reason: String,
    },
    #[error("transaction {gtrid} completed with heuristic outcome {outcome}")]
    Heuristic {
        gtrid: GlobalTransactionId,
        outcome: HeuristicOutcome,
    },
    #[error("transaction {gtrid} cannot move from {from} to {to}")]
    IllegalState {
        gtrid: GlobalTransactionId,
        from: Status,
        to: Status,
    },
    #[error("cannot enlist {resource} in transaction {gtrid}: {reason}")]
    EnlistmentRefused {
        gtrid: GlobalTransactionId,
        resource: String,
        reason: String,
    },
    #[error("listener vetoed moving transaction {gtrid} to {to}: {reason}")]
    ListenerVeto {
        gtrid: GlobalTransactionId,
        to: Status,
        reason: String,
    },
    #[error("no transaction is associated with the calling thread")]
    NoTransaction,
    #[error("calling thread is already associated with transaction {0}")]
    AlreadyAssociated(GlobalTransactionId),
    #[error("transaction {0} is not managed by this coordinator")]
    NotManaged(GlobalTransactionId),
    #[error("cannot mint a transaction id: {0}")]
    Uid(#[from] UidError),
    #[error("journal failure: {0}")]
    Journal(#[from] JournalError),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

/// Failure reported by a resource manager for one branch call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("branch is unknown to the resource manager")]
    BranchUnknown,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("branch was completed heuristically: {0}")]
    Heuristic(HeuristicOutcome),
    #[error("call did not return within {0:?}")]
    Timeout(Duration),
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("journal failure: {0}")]
    Journal(#[from] JournalError),
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid server id: {0}")]
    ServerId(#[from] UidError),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{field} must not exceed {max} seconds")]
    TooLarge { field: &'static str, max: u64 },
    #[error("both journal parts point to {0:?}")]
    SameJournalPaths(PathBuf),
}
