//! Shipment identity, requests and lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::snapshot::SnapshotDefinition;

/// Identity of one shipment: which snapshot of which resource goes to which remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShipmentKey {
    pub rsc_name: String,
    pub snap_name: String,
    pub remote_name: String,
}

impl ShipmentKey {
    pub fn new(
        rsc_name: impl Into<String>,
        snap_name: impl Into<String>,
        remote_name: impl Into<String>,
    ) -> Self {
        Self {
            rsc_name: rsc_name.into(),
            snap_name: snap_name.into(),
            remote_name: remote_name.into(),
        }
    }
}

impl fmt::Display for ShipmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -> {}", self.rsc_name, self.snap_name, self.remote_name)
    }
}

/// Placement information handed over by the destination of a cross-cluster shipment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementContext {
    /// Local snapshot definition the destination still has and wants as incremental base
    pub base_snap_dfn_uuid: Option<Uuid>,
    /// Node on the destination cluster that will receive
    pub target_node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    pub rsc_name: String,
    pub snap_name: String,
    pub remote_name: String,
    pub preferred_node: Option<String>,
    pub schedule: Option<String>,
    pub allow_incremental: bool,
    pub placement: Option<PlacementContext>,
}

impl ShipmentRequest {
    pub fn new(
        rsc_name: impl Into<String>,
        snap_name: impl Into<String>,
        remote_name: impl Into<String>,
    ) -> Self {
        Self {
            rsc_name: rsc_name.into(),
            snap_name: snap_name.into(),
            remote_name: remote_name.into(),
            preferred_node: None,
            schedule: None,
            allow_incremental: true,
            placement: None,
        }
    }

    pub fn key(&self) -> ShipmentKey {
        ShipmentKey::new(&self.rsc_name, &self.snap_name, &self.remote_name)
    }
}

/// Lifecycle of a shipment, derived from snapshot-definition flags and queue membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShipmentState {
    Created,
    Queued,
    Shipping,
    Shipped,
    Aborting,
}

impl ShipmentState {
    pub fn derive(snap_dfn: &SnapshotDefinition, queued: bool) -> Self {
        let flags = snap_dfn.flags;
        if flags.shipping_abort {
            ShipmentState::Aborting
        } else if flags.shipped {
            ShipmentState::Shipped
        } else if flags.shipping {
            ShipmentState::Shipping
        } else if queued {
            ShipmentState::Queued
        } else {
            ShipmentState::Created
        }
    }

    pub fn can_transition_to(self, next: ShipmentState) -> bool {
        use ShipmentState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Shipping)
                | (Queued, Shipping)
                | (Queued, Aborting)
                | (Shipping, Shipped)
                | (Shipping, Aborting)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ShipmentState::Shipped)
    }
}
