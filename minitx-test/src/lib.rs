//! Harness for end-to-end coordinator scenarios.
//!
//! A [`Scenario`] owns a journal directory and a fixed set of scripted
//! resources that outlive any coordinator started on them, so a test can drop
//! a coordinator mid-transaction and start a new one as after a crash.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use minitx::resource::mock::ScriptedResource;
use minitx::{
    Coordinator, CoordinatorConfig, CoordinatorResult, GlobalTransactionId, RecordStatus,
    ResourceRef,
};
use minitx_journal::{DiskJournal, JournalConfig, JournalImage, JournalResult};
use tempfile::TempDir;

pub struct Scenario {
    _dir: TempDir,
    config: CoordinatorConfig,
    resources: BTreeMap<String, Arc<ScriptedResource>>,
}

impl Scenario {
    /// Creates a scenario with one scripted resource per name.
    pub fn new(names: &[&str]) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let config = CoordinatorConfig {
            server_id: "e2e".to_string(),
            journal: JournalConfig::in_dir(dir.path()),
            background_recovery_interval_secs: 0,
            recovery_retention_secs: 0,
            graceful_shutdown_interval_secs: 0,
            ..Default::default()
        };
        let resources = names
            .iter()
            .map(|name| (name.to_string(), Arc::new(ScriptedResource::new(*name))))
            .collect();
        Ok(Self {
            _dir: dir,
            config,
            resources,
        })
    }

    pub fn config_mut(&mut self) -> &mut CoordinatorConfig {
        &mut self.config
    }

    pub fn resource(&self, name: &str) -> Option<Arc<ScriptedResource>> {
        self.resources.get(name).cloned()
    }

    /// Starts a coordinator with every resource registered. Startup runs
    /// recovery.
    pub fn start(&self) -> CoordinatorResult<Coordinator> {
        let resources = self
            .resources
            .values()
            .map(|resource| resource.clone() as ResourceRef)
            .collect();
        Coordinator::open_with_resources(self.config.clone(), resources)
    }

    /// Reads the journal files without opening them for writing.
    pub fn journal(&self) -> JournalResult<JournalImage> {
        DiskJournal::inspect(&self.config.journal.part1_path, &self.config.journal.part2_path)
    }

    /// The records of `gtrid` as (status, names) pairs, in journal order.
    pub fn records_of(
        &self,
        gtrid: &GlobalTransactionId,
    ) -> JournalResult<Vec<(RecordStatus, BTreeSet<String>)>> {
        Ok(self
            .journal()?
            .records
            .into_iter()
            .filter(|record| &record.gtrid == gtrid)
            .map(|record| (record.status, record.unique_names))
            .collect())
    }
}
