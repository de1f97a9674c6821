use std::collections::BTreeSet;
use std::fmt;

use minitx_common::{BranchIdGenerator, GlobalTransactionId, Xid};
use strum::Display;
use tracing::debug;

use super::ResourceRef;
use crate::error::{TransactionError, TransactionResult};

/// Protocol state of one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    Active,
    Ended,
    Prepared,
    Committed,
    OnePhaseCommitted,
    RolledBack,
    /// Voted read-only; takes no part in the second phase.
    Unused,
    /// The last call failed or the branch completed heuristically against the
    /// decision.
    Failed,
}

pub struct ResourceBranch {
    resource: ResourceRef,
    xid: Xid,
    state: BranchState,
}

impl ResourceBranch {
    pub fn unique_name(&self) -> &str {
        self.resource.unique_name()
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn state(&self) -> BranchState {
        self.state
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn is_last_resource(&self) -> bool {
        self.resource.is_last_resource()
    }

    pub(crate) fn set_state(&mut self, state: BranchState) {
        self.state = state;
    }
}

impl fmt::Debug for ResourceBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBranch")
            .field("resource", &self.unique_name())
            .field("xid", &self.xid)
            .field("state", &self.state)
            .finish()
    }
}

/// The branches of one transaction, in enlistment order.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    branches: Vec<ResourceBranch>,
    bquals: BranchIdGenerator,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `resource` as a new branch of `gtrid`.
    ///
    /// Enlisting a resource whose branch is still active is a no-op and
    /// returns false. Any other repeated enlistment is refused.
    pub fn enlist(
        &mut self,
        gtrid: &GlobalTransactionId,
        resource: ResourceRef,
        allow_last_resource: bool,
    ) -> TransactionResult<bool> {
        let name = resource.unique_name().to_string();
        let refuse = |reason: &str| TransactionError::EnlistmentRefused {
            gtrid: gtrid.clone(),
            resource: name.clone(),
            reason: reason.to_string(),
        };

        if let Some(branch) = self.find(&name) {
            return match branch.state {
                BranchState::Active => Ok(false),
                state => Err(refuse(&format!("its branch is already {state}"))),
            };
        }
        if resource.is_last_resource() {
            if !allow_last_resource {
                return Err(refuse("last resource commit is disabled"));
            }
            if self.branches.iter().any(ResourceBranch::is_last_resource) {
                return Err(refuse("another last resource is already enlisted"));
            }
        }

        let xid = Xid::new(gtrid.clone(), self.bquals.next());
        resource
            .start(&xid)
            .map_err(|e| refuse(&format!("start failed: {e}")))?;
        debug!(%gtrid, resource = %name, bqual = %xid.bqual(), "branch enlisted");
        self.branches.push(ResourceBranch {
            resource,
            xid,
            state: BranchState::Active,
        });
        Ok(true)
    }

    pub fn find(&self, unique_name: &str) -> Option<&ResourceBranch> {
        self.branches
            .iter()
            .find(|branch| branch.unique_name() == unique_name)
    }

    pub fn branches(&self) -> &[ResourceBranch] {
        &self.branches
    }

    pub(crate) fn branches_mut(&mut self) -> &mut [ResourceBranch] {
        &mut self.branches
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Unique names of the branches in one of `states`.
    pub fn names_in(&self, states: &[BranchState]) -> BTreeSet<String> {
        self.branches
            .iter()
            .filter(|branch| states.contains(&branch.state))
            .map(|branch| branch.unique_name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use minitx_common::UidGenerator;

    use super::*;
    use crate::resource::mock::ScriptedResource;

    fn gtrid() -> GlobalTransactionId {
        UidGenerator::new("registry").unwrap().next_gtrid().unwrap()
    }

    #[test]
    fn test_enlist_assigns_distinct_branches() {
        let gtrid = gtrid();
        let mut registry = ResourceRegistry::new();
        let a = Arc::new(ScriptedResource::new("a"));
        let b = Arc::new(ScriptedResource::new("b"));

        assert!(registry.enlist(&gtrid, a.clone(), false).unwrap());
        assert!(registry.enlist(&gtrid, b, false).unwrap());
        // Same resource again while active.
        assert!(!registry.enlist(&gtrid, a.clone(), false).unwrap());

        let branches = registry.branches();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].unique_name(), "a");
        assert_eq!(branches[0].xid().gtrid(), &gtrid);
        assert_ne!(branches[0].xid().bqual(), branches[1].xid().bqual());
        assert_eq!(a.calls().len(), 1);
    }

    #[test]
    fn test_enlist_after_end_is_refused() {
        let gtrid = gtrid();
        let mut registry = ResourceRegistry::new();
        let a = Arc::new(ScriptedResource::new("a"));
        registry.enlist(&gtrid, a.clone(), false).unwrap();
        registry.branches_mut()[0].set_state(BranchState::Ended);

        assert!(matches!(
            registry.enlist(&gtrid, a, false),
            Err(TransactionError::EnlistmentRefused { .. })
        ));
    }

    #[test]
    fn test_last_resource_rules() {
        let gtrid = gtrid();
        let mut registry = ResourceRegistry::new();
        let first = Arc::new(ScriptedResource::new("lrc-1"));
        first.set_last_resource(true);
        let second = Arc::new(ScriptedResource::new("lrc-2"));
        second.set_last_resource(true);

        assert!(registry.enlist(&gtrid, first.clone(), false).is_err());
        assert!(registry.enlist(&gtrid, first, true).unwrap());
        assert!(registry.enlist(&gtrid, second, true).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_names_in_states() {
        let gtrid = gtrid();
        let mut registry = ResourceRegistry::new();
        for name in ["a", "b", "c"] {
            registry
                .enlist(&gtrid, Arc::new(ScriptedResource::new(name)), false)
                .unwrap();
        }
        registry.branches_mut()[0].set_state(BranchState::Prepared);
        registry.branches_mut()[1].set_state(BranchState::Unused);
        registry.branches_mut()[2].set_state(BranchState::Prepared);

        let names = registry.names_in(&[BranchState::Prepared]);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["a", "c"]);
    }
}
