use chrono::{DateTime, Utc};
use minitx_common::{GlobalTransactionId, HeuristicOutcome};
use parking_lot::Mutex;
use strum::Display;
use tracing::error;

/// What the coordinator decided for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Decision {
    Commit,
    Rollback,
}

impl Decision {
    pub fn is_commit(&self) -> bool {
        matches!(self, Decision::Commit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicEntry {
    pub gtrid: GlobalTransactionId,
    pub resource: String,
    pub outcome: HeuristicOutcome,
    pub decision: Decision,
    pub time: DateTime<Utc>,
}

/// Operator-visible log of branches that resolved against the decision.
#[derive(Debug, Default)]
pub struct HeuristicReport {
    entries: Mutex<Vec<HeuristicEntry>>,
}

impl HeuristicReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        gtrid: &GlobalTransactionId,
        resource: &str,
        outcome: HeuristicOutcome,
        decision: Decision,
    ) {
        error!(%gtrid, resource, %outcome, %decision, "heuristic outcome reported by resource");
        self.entries.lock().push(HeuristicEntry {
            gtrid: gtrid.clone(),
            resource: resource.to_string(),
            outcome,
            decision,
            time: Utc::now(),
        });
    }

    pub fn entries(&self) -> Vec<HeuristicEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
