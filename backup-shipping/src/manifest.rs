//! Backup manifest types.
//!
//! A manifest is uploaded once per backup, after every volume data object has been shipped.
//! It lists the data objects per volume and optionally names the manifest this backup is
//! incremental to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::key::{self, BackupKey};

/// Backup manifest, serialized as JSON in `<id>.meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub rsc_name: String,
    pub snap_name: String,
    pub node_name: String,
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
    /// Manifest key of the incremental base; `None` for full backups.
    #[serde(default)]
    pub based_on: Option<String>,
    pub cluster_id: String,
    /// Identity of the snapshot definition the backup was taken from
    #[serde(default)]
    pub snap_dfn_uuid: Option<Uuid>,
    /// Volume number to data objects
    pub backups: BTreeMap<u32, Vec<DataObjectInfo>>,
    /// Volume number to usable size in KiB at the time of the snapshot
    #[serde(default)]
    pub volume_sizes: BTreeMap<u32, u64>,
}

/// One uploaded data object of a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObjectInfo {
    pub name: String,
    pub finished_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl BackupManifest {
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Parsed key of the base manifest, if any and if it is a valid manifest key.
    pub fn based_on_key(&self) -> Option<BackupKey> {
        self.based_on.as_deref().and_then(key::parse_manifest_key)
    }

    /// All data object names over all volumes.
    pub fn data_keys(&self) -> impl Iterator<Item = &str> {
        self.backups.values().flatten().map(|info| info.name.as_str())
    }

    /// Sum of every known data object size, saturating. Unknown sizes count as zero.
    pub fn known_size(&self) -> u64 {
        self.backups
            .values()
            .flatten()
            .filter_map(|info| info.size)
            .fold(0, u64::saturating_add)
    }
}
