//! Outbound collaborators: satellites and peer clusters.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PlacementContext, ShipmentKey};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Pushes changed snapshot state to the satellite of a node.
#[async_trait]
pub trait SatelliteNotifier: Send + Sync {
    async fn notify(&self, node: &str) -> Result<(), TransportError>;
}

/// Notifies every node concurrently. One result per node, in node order.
pub async fn notify_all(
    notifier: &dyn SatelliteNotifier,
    nodes: &BTreeSet<String>,
) -> Vec<(String, Result<(), TransportError>)> {
    let results = join_all(nodes.iter().map(|node| notifier.notify(node))).await;
    nodes.iter().cloned().zip(results).collect()
}

/// What the sending cluster tells the destination when asking for placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub key: ShipmentKey,
    pub src_cluster_id: String,
    /// Snapshots the destination may already have received and could use as base
    pub base_candidates: BTreeSet<Uuid>,
    pub volume_sizes: BTreeMap<u32, u64>,
    pub preferred_node: Option<String>,
}

/// Where the receiving satellite listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub target_node: String,
    pub ip: String,
    pub port: u16,
}

/// Decision points of the cross-cluster handshake. The wire protocol lives elsewhere.
#[async_trait]
pub trait PeerClusterTransport: Send + Sync {
    /// "Here are base-snapshot candidates", answered with the placement decision.
    async fn request_placement(
        &self,
        remote_name: &str,
        request: PlacementRequest,
    ) -> Result<PlacementContext, TransportError>;

    /// "Here is the chosen source node", answered with connection info.
    async fn announce_shipment(
        &self,
        remote_name: &str,
        key: &ShipmentKey,
        source_node: &str,
    ) -> Result<ConnectionInfo, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingNotifier;

    #[tokio::test]
    async fn test_notify_all_reports_per_node() {
        let notifier = RecordingNotifier::failing(&["n2"]);
        let nodes: BTreeSet<String> = ["n1", "n2", "n3"].iter().map(|n| n.to_string()).collect();

        let results = notify_all(&notifier, &nodes).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].0, "n2");
        assert!(results[1].1.is_err());
        assert_eq!(notifier.notified().await, vec!["n1".to_string(), "n3".to_string()]);
    }
}
