use minitx_common::Xid;
use parking_lot::Mutex;
use tracing::debug;

use super::{ResourceManager, Vote};
use crate::error::{ResourceError, ResourceResult};

/// A resource with plain local transactions and no prepare step.
pub trait LocalResource: Send + Sync {
    fn unique_name(&self) -> &str;

    fn commit(&self) -> ResourceResult<()>;

    fn rollback(&self) -> ResourceResult<()>;
}

/// Adapts a [`LocalResource`] so it can take part in a global transaction as
/// its last resource.
///
/// The coordinator never asks it to vote; it is committed in one phase once
/// every other branch is prepared. A local transaction is never in doubt, so
/// there is nothing to recover.
pub struct LastResource<R> {
    inner: R,
    current: Mutex<Option<Xid>>,
}

impl<R: LocalResource> LastResource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            current: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn check_current(&self, xid: &Xid) -> ResourceResult<()> {
        match &*self.current.lock() {
            Some(current) if current == xid => Ok(()),
            _ => Err(ResourceError::BranchUnknown),
        }
    }
}

impl<R: LocalResource> ResourceManager for LastResource<R> {
    fn unique_name(&self) -> &str {
        self.inner.unique_name()
    }

    fn start(&self, xid: &Xid) -> ResourceResult<()> {
        let mut current = self.current.lock();
        if let Some(other) = &*current {
            return Err(ResourceError::ProtocolViolation(format!(
                "local transaction is already part of {other}"
            )));
        }
        *current = Some(xid.clone());
        Ok(())
    }

    fn prepare(&self, _xid: &Xid) -> ResourceResult<Vote> {
        Err(ResourceError::ProtocolViolation(
            "a last resource cannot be prepared".into(),
        ))
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> ResourceResult<()> {
        if !one_phase {
            return Err(ResourceError::ProtocolViolation(
                "a last resource only commits in one phase".into(),
            ));
        }
        self.check_current(xid)?;
        let result = self.inner.commit();
        *self.current.lock() = None;
        debug!(resource = self.unique_name(), %xid, ok = result.is_ok(), "local transaction committed");
        result
    }

    fn rollback(&self, xid: &Xid) -> ResourceResult<()> {
        self.check_current(xid)?;
        let result = self.inner.rollback();
        *self.current.lock() = None;
        result
    }

    fn recover(&self) -> ResourceResult<Vec<Xid>> {
        Ok(Vec::new())
    }

    fn is_last_resource(&self) -> bool {
        true
    }
}
