use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::props::{self, Props};
use super::snapshot::SnapshotDefinition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    pub number: u32,
    pub size_kib: u64,
}

/// Deployment of a resource on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub node_name: String,
    pub diskless: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    pub volumes: BTreeMap<u32, VolumeDefinition>,
    /// Node name to resource
    pub resources: BTreeMap<String, Resource>,
    /// Snapshot name to definition
    pub snapshot_dfns: BTreeMap<String, SnapshotDefinition>,
    pub props: Props,
    /// Incremental chains must stay on the node that shipped the base (ZFS or LUKS backed volumes).
    pub same_node_chain: bool,
}

impl ResourceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volumes: BTreeMap::new(),
            resources: BTreeMap::new(),
            snapshot_dfns: BTreeMap::new(),
            props: Props::default(),
            same_node_chain: false,
        }
    }

    pub fn diskful_nodes(&self) -> impl Iterator<Item = &str> {
        self.resources
            .values()
            .filter(|r| !r.diskless)
            .map(|r| r.node_name.as_str())
    }

    pub fn last_started_or_queued(&self, remote_name: &str) -> Option<&str> {
        self.props.get(
            props::KEY_LAST_STARTED_OR_QUEUED,
            &props::remote_namespace(remote_name),
        )
    }

    pub fn last_shipped(&self, remote_name: &str) -> Option<&str> {
        self.props
            .get(props::KEY_LAST_SHIPPED, &props::remote_namespace(remote_name))
    }

    /// Current volume sizes in the layout snapshots record them.
    pub fn volume_sizes(&self) -> BTreeMap<u32, u64> {
        self.volumes
            .values()
            .map(|v| (v.number, v.size_kib))
            .collect()
    }

    /// Whether a backup of this resource is currently shipping to any remote.
    pub fn has_backup_in_progress(&self) -> bool {
        self.snapshot_dfns
            .values()
            .any(|s| s.is_shipping_backup() && s.snapshots.values().any(|i| i.flags.backup_source))
    }
}
