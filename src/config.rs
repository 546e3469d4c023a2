//! Node configuration
//!
//! Tuning knobs for the migration control plane and snapshot transfer.
//! Lock stripe counts trade memory against false contention between keys
//! that alias to the same stripe; both pools must be powers of two because
//! stripe selection is mask-based.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MagnetiteError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stripe count for a migration job's private key-lock pool
    pub normal_lock_stripes: usize,
    /// Stripe count for the node-wide per-command lock pool
    pub large_lock_stripes: usize,
    /// Parallel transfer workers per migration page
    pub migrate_workers: usize,
    /// Keys assigned to each worker per page; page size is
    /// `migrate_workers * migrate_keys_per_worker`
    pub migrate_keys_per_worker: usize,
    /// LRANGE window when exporting list values
    pub list_scan_step: usize,
    /// Idle outbound connections retained per destination
    pub max_idle_conns: usize,
    /// Directory snapshots are checkpointed into
    pub snapshot_path: PathBuf,
    /// Scratch directory a received snapshot is reconstructed under
    pub dbsync_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            normal_lock_stripes: 1024,
            large_lock_stripes: 8 << 10,
            migrate_workers: 10,
            migrate_keys_per_worker: 1000,
            list_scan_step: 5000,
            max_idle_conns: 10,
            snapshot_path: PathBuf::from("snapshot"),
            dbsync_path: PathBuf::from("dbsync"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !self.normal_lock_stripes.is_power_of_two() {
            return Err(MagnetiteError::Config(
                "normal_lock_stripes must be a power of two".to_string(),
            ));
        }
        if !self.large_lock_stripes.is_power_of_two() {
            return Err(MagnetiteError::Config(
                "large_lock_stripes must be a power of two".to_string(),
            ));
        }
        if self.migrate_workers == 0 {
            return Err(MagnetiteError::Config(
                "migrate_workers must be at least 1".to_string(),
            ));
        }
        if self.migrate_keys_per_worker == 0 {
            return Err(MagnetiteError::Config(
                "migrate_keys_per_worker must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
