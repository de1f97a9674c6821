use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use minitx::resource::mock::ScriptedResource;
use minitx::{Coordinator, CoordinatorConfig, GlobalTransactionId, RecordStatus, ResourceRef};
use minitx_common::{BranchId, UidGenerator, Xid};
use minitx_journal::{JournalRecord, TransactionJournal, open_journal};

pub const SERVER_ID: &str = "test-node";

pub struct TestCleaner {
    dir: PathBuf,
}

impl Drop for TestCleaner {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// A config journaling into a fresh directory, without background recovery
/// and with no retention.
pub fn create_test_config() -> (CoordinatorConfig, TestCleaner) {
    let dir = std::env::temp_dir().join(format!(
        "minitx_test_{}_{}",
        chrono::Utc::now().timestamp(),
        rand::random::<u32>()
    ));
    fs::create_dir_all(&dir).unwrap();
    let mut config = CoordinatorConfig {
        server_id: SERVER_ID.to_string(),
        background_recovery_interval_secs: 0,
        recovery_retention_secs: 0,
        graceful_shutdown_interval_secs: 0,
        ..Default::default()
    };
    config.journal = minitx_journal::JournalConfig::in_dir(&dir);
    (config, TestCleaner { dir })
}

/// Opens a coordinator and hands back its journal for inspection.
pub fn open_coordinator(
    config: &CoordinatorConfig,
    resources: &[&Arc<ScriptedResource>],
) -> (Coordinator, Arc<dyn TransactionJournal>) {
    let journal = open_journal(&config.journal).unwrap();
    let resources = resources
        .iter()
        .map(|resource| (*resource).clone() as ResourceRef)
        .collect();
    let coordinator = Coordinator::with_journal(config.clone(), journal.clone(), resources).unwrap();
    (coordinator, journal)
}

pub fn scripted(name: &str) -> Arc<ScriptedResource> {
    Arc::new(ScriptedResource::new(name))
}

pub fn names(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// The records of `gtrid` as (status, names) pairs, in journal order.
pub fn records_of(
    journal: &Arc<dyn TransactionJournal>,
    gtrid: &GlobalTransactionId,
) -> Vec<(RecordStatus, BTreeSet<String>)> {
    journal
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|record: &JournalRecord| &record.gtrid == gtrid)
        .map(|record| (record.status, record.unique_names))
        .collect()
}

/// A branch of a transaction begun by an earlier coordinator instance on the
/// same server.
#[allow(dead_code)]
pub fn previous_instance_xid(generator: &UidGenerator, bqual: u32) -> Xid {
    let gtrid = generator.next_gtrid().unwrap();
    Xid::new(gtrid, BranchId::from_counter(bqual))
}
