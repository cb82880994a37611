//! Namespaced string properties attached to nodes, resource definitions, snapshots and the controller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const NAMESPC_BACKUP_SHIPPING: &str = "BackupShipping";
pub const NAMESPC_L2L: &str = "BackupShipping/L2L";

/// Node or controller: concurrent source shipments per node
pub const KEY_MAX_CONCURRENT_BACKUPS_PER_NODE: &str = "MaxConcurrentBackupsPerNode";
/// Controller and snapshot definition: suffix for generated keys
pub const KEY_SITE_SUFFIX: &str = "SiteSuffix";
/// Resource definition, in `BackupShipping/<remote>`
pub const KEY_LAST_STARTED_OR_QUEUED: &str = "LastStartedOrQueued";
/// Resource definition, in `BackupShipping/<remote>`
pub const KEY_LAST_SHIPPED: &str = "LastShipped";
/// Snapshot definition, in `BackupShipping/<remote>`
pub const KEY_SOURCE_NODE: &str = "SourceNode";
/// Snapshot definition: backup timestamp as `YYYYMMDD_HHMMSS`
pub const KEY_START_TIMESTAMP: &str = "StartTimestamp";
/// Snapshot definition
pub const KEY_SCHEDULE: &str = "Schedule";
/// Snapshot
pub const KEY_TARGET_REMOTE: &str = "TargetRemote";
/// Snapshot: name of the base snapshot this shipment is incremental to
pub const KEY_LAST_SNAPSHOT: &str = "LastSnapshot";
/// Snapshot definition on the receiving cluster, in `BackupShipping/L2L`
pub const KEY_SOURCE_SNAP_DFN_UUID: &str = "SourceSnapDfnUuid";

/// `BackupShipping/<remote>`
pub fn remote_namespace(remote_name: &str) -> String {
    format!("{NAMESPC_BACKUP_SHIPPING}/{remote_name}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Props {
    map: BTreeMap<String, String>,
}

impl Props {
    fn path(key: &str, namespace: &str) -> String {
        if namespace.is_empty() {
            key.to_string()
        } else {
            format!("{namespace}/{key}")
        }
    }

    pub fn get(&self, key: &str, namespace: &str) -> Option<&str> {
        self.map.get(&Self::path(key, namespace)).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, namespace: &str, value: impl Into<String>) -> Option<String> {
        self.map.insert(Self::path(key, namespace), value.into())
    }

    pub fn remove(&mut self, key: &str, namespace: &str) -> Option<String> {
        self.map.remove(&Self::path(key, namespace))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Parses an integer property. Unparseable values are treated as absent.
    pub fn get_i64(&self, key: &str, namespace: &str) -> Option<i64> {
        self.get(key, namespace).and_then(|v| v.trim().parse().ok())
    }
}
