//! Configuration for the OSD replication subsystem.
//!
//! Configuration is plain JSON. Every field has a default, so a file only
//! needs to name what it changes:
//!
//! ```json
//! {
//!   "dissemination": { "local_node": "osd-3", "default_strategy": "simple" },
//!   "availability": { "initial_timeout_ms": 30000 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use xtfs_common::{AvailabilityConfig, NodeId, TransferStrategyKind};

use crate::error::{ReplicationError, ReplicationResult};

/// Configuration of the object dissemination and its stage task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisseminationConfig {
    /// Identity of this OSD; its replica is never asked for objects.
    pub local_node: NodeId,
    /// Strategy used when the local replica does not name one.
    pub default_strategy: TransferStrategyKind,
    /// Upper bound of background object fetches in flight per file.
    pub max_objects_in_progress_per_file: usize,
    /// Upper bound of background object fetches in flight over all files.
    /// Split evenly between the files being filled.
    pub max_objects_in_progress_overall: usize,
    /// Capacity of the stage's request queue.
    pub channel_capacity: usize,
    /// Seed for the random strategy; `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for DisseminationConfig {
    fn default() -> Self {
        Self {
            local_node: NodeId::new("localhost"),
            default_strategy: TransferStrategyKind::Random,
            max_objects_in_progress_per_file: 5,
            max_objects_in_progress_overall: 20,
            channel_capacity: 1024,
            rng_seed: None,
        }
    }
}

/// Top-level replication configuration of an OSD.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsdReplicationConfig {
    /// Dissemination settings.
    pub dissemination: DisseminationConfig,
    /// OSD availability tracker settings.
    pub availability: AvailabilityConfig,
}

impl OsdReplicationConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> ReplicationResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ReplicationError::Config {
            msg: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> ReplicationResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ReplicationError::Config {
            msg: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&json)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.dissemination.max_objects_in_progress_per_file == 0 {
            return Err(ReplicationError::Config {
                msg: "max_objects_in_progress_per_file must be positive".into(),
            });
        }
        if self.dissemination.max_objects_in_progress_overall == 0 {
            return Err(ReplicationError::Config {
                msg: "max_objects_in_progress_overall must be positive".into(),
            });
        }
        if self.dissemination.channel_capacity == 0 {
            return Err(ReplicationError::Config {
                msg: "channel_capacity must be positive".into(),
            });
        }
        if self.availability.cleanup_interval_ms == 0 {
            return Err(ReplicationError::Config {
                msg: "cleanup_interval_ms must be positive".into(),
            });
        }
        Ok(())
    }
}
