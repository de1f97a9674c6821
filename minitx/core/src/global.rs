//! Optional process-wide coordinator.
//!
//! Code that can pass a [`Coordinator`] around should do so. This is for
//! integrations that need to find the coordinator without a handle.

use std::sync::OnceLock;

use tracing::warn;

use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::error::{CoordinatorError, CoordinatorResult};

static GLOBAL: OnceLock<Coordinator> = OnceLock::new();

/// Opens the process-wide coordinator. Fails if it was already initialized.
pub fn init_global_coordinator(config: CoordinatorConfig) -> CoordinatorResult<Coordinator> {
    if GLOBAL.get().is_some() {
        return Err(CoordinatorError::AlreadyInitialized);
    }
    let coordinator = Coordinator::open(config)?;
    if let Err(lost) = GLOBAL.set(coordinator.clone()) {
        if let Err(e) = lost.shutdown() {
            warn!(error = %e, "failed to shut down redundant coordinator");
        }
        return Err(CoordinatorError::AlreadyInitialized);
    }
    Ok(coordinator)
}

pub fn global_coordinator() -> Option<Coordinator> {
    GLOBAL.get().cloned()
}
