//! Snapshot definitions and their per-node instances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::props::{self, Props};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDfnFlags {
    pub shipping: bool,
    pub shipped: bool,
    pub backup: bool,
    pub shipping_abort: bool,
    pub delete: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFlags {
    pub backup_source: bool,
    pub backup_target: bool,
    pub delete: bool,
}

/// Snapshot of one resource on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub node_name: String,
    pub flags: SnapshotFlags,
    pub props: Props,
}

impl Snapshot {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            flags: SnapshotFlags::default(),
            props: Props::default(),
        }
    }

    pub fn target_remote(&self) -> Option<&str> {
        self.props
            .get(props::KEY_TARGET_REMOTE, props::NAMESPC_BACKUP_SHIPPING)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDefinition {
    pub rsc_name: String,
    pub name: String,
    pub uuid: Uuid,
    pub flags: SnapshotDfnFlags,
    pub props: Props,
    /// Volume number to size in KiB, recorded when the snapshot was taken
    pub volume_sizes: BTreeMap<u32, u64>,
    /// Node name to instance
    pub snapshots: BTreeMap<String, Snapshot>,
}

impl SnapshotDefinition {
    pub fn new(rsc_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            rsc_name: rsc_name.into(),
            name: name.into(),
            uuid: Uuid::new_v4(),
            flags: SnapshotDfnFlags::default(),
            props: Props::default(),
            volume_sizes: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.delete
    }

    /// Shipping a backup right now (abort requested or not).
    pub fn is_shipping_backup(&self) -> bool {
        self.flags.shipping && self.flags.backup
    }

    pub fn snapshot_on(&self, node_name: &str) -> Option<&Snapshot> {
        self.snapshots.get(node_name)
    }

    pub fn source_node(&self, remote_name: &str) -> Option<&str> {
        self.props
            .get(props::KEY_SOURCE_NODE, &props::remote_namespace(remote_name))
    }

    pub fn start_timestamp(&self) -> Option<&str> {
        self.props
            .get(props::KEY_START_TIMESTAMP, props::NAMESPC_BACKUP_SHIPPING)
    }

    pub fn site_suffix(&self) -> Option<&str> {
        self.props
            .get(props::KEY_SITE_SUFFIX, props::NAMESPC_BACKUP_SHIPPING)
    }

    /// Identity of the source snapshot definition, set on snapshots received from a peer cluster.
    pub fn source_snap_dfn_uuid(&self) -> Option<Uuid> {
        self.props
            .get(props::KEY_SOURCE_SNAP_DFN_UUID, props::NAMESPC_L2L)
            .and_then(|v| Uuid::parse_str(v).ok())
    }

    /// Remote the backup is being shipped to, taken from the source snapshot.
    pub fn target_remote(&self) -> Option<&str> {
        self.snapshots
            .values()
            .find(|s| s.flags.backup_source)
            .and_then(Snapshot::target_remote)
    }
}
