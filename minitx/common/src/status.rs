//! Status vocabulary shared by the state machine and the journal.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// Status of a global transaction as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Pseudo-state: no transaction exists (yet, or any more).
    NoTransaction,
    Active,
    MarkedRollback,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    /// Terminal, but the outcome of some branches is not known.
    Unknown,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Committed | Status::RolledBack | Status::Unknown)
    }

    /// Returns true while branches may still be enlisted.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Active)
    }

    /// The legal edges of the state machine.
    pub fn can_transition_to(&self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (NoTransaction, Active)
                | (Active, MarkedRollback | Preparing | Committing | RollingBack)
                | (MarkedRollback, RollingBack)
                | (Preparing, Prepared | Committed | RollingBack | Unknown)
                | (Prepared, Committing)
                | (Committing, Committed | RollingBack | Unknown)
                | (RollingBack, RolledBack | Unknown)
        )
    }
}

/// Type of a journal record.
///
/// The discriminant order is part of the on-disk format: new variants must only
/// ever be appended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    StatusActive,
    StatusPrepared,
    StatusCommitting,
    StatusCommitted,
    StatusRolledback,
    StatusUnknown,
}

impl RecordStatus {
    /// Terminal records resolve the resource names they list.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::StatusCommitted | RecordStatus::StatusRolledback
        )
    }

    /// Records that commit the coordinator to the commit decision.
    pub fn is_commit_decision(&self) -> bool {
        matches!(
            self,
            RecordStatus::StatusPrepared | RecordStatus::StatusCommitting
        )
    }

    /// Records that must reach stable storage before the caller proceeds.
    pub fn requires_force(&self) -> bool {
        matches!(
            self,
            RecordStatus::StatusPrepared
                | RecordStatus::StatusCommitted
                | RecordStatus::StatusRolledback
        )
    }

    /// Records recovery can act upon. Others are skipped when the journal
    /// filters statuses.
    pub fn is_recovery_relevant(&self) -> bool {
        !matches!(
            self,
            RecordStatus::StatusActive | RecordStatus::StatusCommitting
        )
    }
}

/// How a resource manager resolved a branch on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum HeuristicOutcome {
    /// The branch was committed.
    Commit,
    /// The branch was rolled back.
    Rollback,
    /// Part of the branch was committed and part rolled back.
    Mixed,
    /// The outcome is not known.
    Hazard,
}

impl HeuristicOutcome {
    /// Returns true if the heuristic outcome matches a decision to commit
    /// (`commit == true`) or roll back.
    pub fn agrees_with(&self, commit: bool) -> bool {
        matches!(
            (self, commit),
            (HeuristicOutcome::Commit, true) | (HeuristicOutcome::Rollback, false)
        )
    }
}
