use std::time::Duration;

use minitx_common::UidGenerator;
use minitx_journal::{JournalConfig, JournalKind};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound of every configured duration, a century.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Settings of one coordinator.
///
/// Loading is left to the embedding application: any serde format works, and
/// missing fields take their default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Prefix of every gtrid this coordinator mints. At most 44 bytes.
    pub server_id: String,
    pub journal: JournalConfig,
    pub default_transaction_timeout_secs: u64,
    /// Period of background recovery. Zero disables it.
    pub background_recovery_interval_secs: u64,
    /// How long a committed journal entry waits for a branch that no resource
    /// reports any more before it is closed.
    pub recovery_retention_secs: u64,
    /// Only recover branches whose gtrid carries this server id.
    pub current_node_only_recovery: bool,
    pub one_phase_commit_optimization: bool,
    /// Run prepare, commit and rollback of the branches concurrently.
    pub asynchronous_2pc: bool,
    /// Size of the branch worker pool. Zero spawns a thread per branch call.
    pub background_threads: usize,
    pub branch_call_timeout_ms: u64,
    pub allow_last_resource_commit: bool,
    pub warn_about_zero_resource_transaction: bool,
    pub graceful_shutdown_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_id: "minitx".to_string(),
            journal: JournalConfig::default(),
            default_transaction_timeout_secs: 60,
            background_recovery_interval_secs: 60,
            recovery_retention_secs: 30,
            current_node_only_recovery: true,
            one_phase_commit_optimization: true,
            asynchronous_2pc: false,
            background_threads: 0,
            branch_call_timeout_ms: 30_000,
            allow_last_resource_commit: false,
            warn_about_zero_resource_transaction: true,
            graceful_shutdown_interval_secs: 60,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        UidGenerator::new(&self.server_id)?;
        if self.default_transaction_timeout_secs == 0 {
            return Err(ConfigError::Zero("default_transaction_timeout_secs"));
        }
        if self.branch_call_timeout_ms == 0 {
            return Err(ConfigError::Zero("branch_call_timeout_ms"));
        }
        for (field, secs) in [
            ("default_transaction_timeout_secs", self.default_transaction_timeout_secs),
            ("background_recovery_interval_secs", self.background_recovery_interval_secs),
            ("recovery_retention_secs", self.recovery_retention_secs),
            ("graceful_shutdown_interval_secs", self.graceful_shutdown_interval_secs),
            ("branch_call_timeout_ms", self.branch_call_timeout_ms / 1000),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::TooLarge {
                    field,
                    max: MAX_DURATION_SECS,
                });
            }
        }
        if self.journal.kind == JournalKind::Disk {
            if self.journal.max_log_size_bytes == 0 {
                return Err(ConfigError::Zero("journal.max_log_size_bytes"));
            }
            if self.journal.part1_path == self.journal.part2_path {
                return Err(ConfigError::SameJournalPaths(
                    self.journal.part1_path.clone(),
                ));
            }
        }
        Ok(())
    }

    pub fn default_transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.default_transaction_timeout_secs)
    }

    pub fn background_recovery_interval(&self) -> Option<Duration> {
        match self.background_recovery_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn recovery_retention(&self) -> Duration {
        Duration::from_secs(self.recovery_retention_secs)
    }

    pub fn branch_call_timeout(&self) -> Duration {
        Duration::from_millis(self.branch_call_timeout_ms)
    }

    pub fn graceful_shutdown_interval(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_interval_secs)
    }
}
