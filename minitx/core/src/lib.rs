//! A two-phase-commit transaction coordinator.
//!
//! [`Coordinator`] begins global transactions, enlists resource managers as
//! branches and drives them through prepare and commit, writing every
//! decision to a write-ahead journal first. After a crash the coordinator
//! replays the journal against the branches the resources still hold in doubt
//! and finishes them.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod global;
pub mod heuristic;
pub mod recovery;
pub mod resource;
pub mod scheduler;
pub mod transaction;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{
    ConfigError, CoordinatorError, CoordinatorResult, RecoveryError, RecoveryResult,
    ResourceError, ResourceResult, TransactionError, TransactionResult,
};
pub use global::{global_coordinator, init_global_coordinator};
pub use heuristic::{Decision, HeuristicEntry, HeuristicReport};
pub use minitx_common::{GlobalTransactionId, HeuristicOutcome, RecordStatus, Status, Xid};
pub use minitx_journal::{JournalConfig, JournalKind};
pub use recovery::{RecoveryReport, RecoveryStats};
pub use resource::{
    BranchState, LastResource, LocalResource, ResourceManager, ResourceRef, Vote,
};
pub use transaction::{StatusListener, Transaction};
