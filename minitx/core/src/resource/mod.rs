//! The resource-manager side of the protocol, as seen by the coordinator.

pub mod last_resource;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod registry;

use std::sync::Arc;

pub use last_resource::{LastResource, LocalResource};
use minitx_common::Xid;
pub use registry::{BranchState, ResourceBranch, ResourceRegistry};
use strum::Display;

use crate::error::ResourceResult;

/// A resource manager's answer to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Vote {
    /// The branch is durably prepared and must be committed or rolled back.
    Commit,
    /// The branch did not change anything and is already finished.
    ReadOnly,
}

/// A participant of global transactions.
///
/// The unique name identifies the resource in the journal and must stay the
/// same across coordinator restarts, otherwise recovery cannot match journal
/// entries to the branches the resource reports.
pub trait ResourceManager: Send + Sync {
    fn unique_name(&self) -> &str;

    /// Associates the branch with the resource's work. Called on enlistment.
    fn start(&self, xid: &Xid) -> ResourceResult<()> {
        let _ = xid;
        Ok(())
    }

    /// Dissociates the branch before completion.
    fn end(&self, xid: &Xid) -> ResourceResult<()> {
        let _ = xid;
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> ResourceResult<Vote>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> ResourceResult<()>;

    fn rollback(&self, xid: &Xid) -> ResourceResult<()>;

    /// Lists the branches that are prepared and wait for an outcome.
    fn recover(&self) -> ResourceResult<Vec<Xid>>;

    /// Discards a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> ResourceResult<()> {
        let _ = xid;
        Ok(())
    }

    /// Last resources cannot prepare. They are committed in one phase after
    /// every other branch voted to commit.
    fn is_last_resource(&self) -> bool {
        false
    }
}

pub type ResourceRef = Arc<dyn ResourceManager>;
