//! Cluster state as seen by the shipment scheduler.

pub mod node;
pub mod props;
pub mod remote;
pub mod resource;
pub mod shipment;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};

pub use node::Node;
pub use props::Props;
pub use remote::{Remote, RemoteKind};
pub use resource::{Resource, ResourceDefinition, VolumeDefinition};
pub use shipment::{PlacementContext, ShipmentKey, ShipmentRequest, ShipmentState};
pub use snapshot::{Snapshot, SnapshotDefinition, SnapshotDfnFlags, SnapshotFlags};

use crate::queue::ShipmentQueues;
use crate::utils::errors::{Result, ShippingError};

/// Everything the scheduler reads and mutates. Only accessed inside a [`crate::scope::ClusterStore`] scope.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub cluster_id: String,
    pub nodes: BTreeMap<String, Node>,
    pub rsc_dfns: BTreeMap<String, ResourceDefinition>,
    pub remotes: BTreeMap<String, Remote>,
    pub ctrl_props: Props,
    pub queues: ShipmentQueues,
    /// Resources with a restore in progress
    pub restores: BTreeSet<String>,
}

impl ClusterState {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            ..Default::default()
        }
    }

    pub fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .get(name)
            .ok_or_else(|| ShippingError::NotFound(format!("node '{name}'")))
    }

    pub fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| ShippingError::NotFound(format!("node '{name}'")))
    }

    pub fn rsc_dfn(&self, name: &str) -> Result<&ResourceDefinition> {
        self.rsc_dfns
            .get(name)
            .ok_or_else(|| ShippingError::NotFound(format!("resource definition '{name}'")))
    }

    pub fn rsc_dfn_mut(&mut self, name: &str) -> Result<&mut ResourceDefinition> {
        self.rsc_dfns
            .get_mut(name)
            .ok_or_else(|| ShippingError::NotFound(format!("resource definition '{name}'")))
    }

    pub fn snap_dfn(&self, rsc_name: &str, snap_name: &str) -> Option<&SnapshotDefinition> {
        self.rsc_dfns
            .get(rsc_name)
            .and_then(|r| r.snapshot_dfns.get(snap_name))
    }

    pub fn snap_dfn_mut(&mut self, rsc_name: &str, snap_name: &str) -> Result<&mut SnapshotDefinition> {
        self.rsc_dfns
            .get_mut(rsc_name)
            .and_then(|r| r.snapshot_dfns.get_mut(snap_name))
            .ok_or_else(|| {
                ShippingError::NotFound(format!("snapshot definition '{rsc_name}/{snap_name}'"))
            })
    }

    pub fn remote(&self, name: &str) -> Result<&Remote> {
        self.remotes
            .get(name)
            .ok_or_else(|| ShippingError::NotFound(format!("remote '{name}'")))
    }

    /// All snapshot definitions of all resources.
    pub fn snapshot_dfns(&self) -> impl Iterator<Item = &SnapshotDefinition> {
        self.rsc_dfns.values().flat_map(|r| r.snapshot_dfns.values())
    }
}
