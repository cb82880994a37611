//! Cluster fixtures and collaborator doubles for unit tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::key;
use crate::manifest::{BackupManifest, DataObjectInfo};
use crate::models::props;
use crate::models::{
    ClusterState, Node, PlacementContext, Remote, Resource, ResourceDefinition, ShipmentKey, Snapshot,
    SnapshotDefinition, VolumeDefinition,
};
use crate::notify::{ConnectionInfo, PeerClusterTransport, PlacementRequest, SatelliteNotifier, TransportError};
use crate::store::RemoteListing;

/// Nodes with optional shipment limits, an object store remote `s3` and a peer cluster `dr`.
pub fn cluster(nodes: &[(&str, Option<i64>)]) -> ClusterState {
    let mut state = ClusterState::new("cluster-a");
    for (name, limit) in nodes {
        let mut node = Node::new(*name);
        if let Some(limit) = limit {
            node.props.set(
                props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
                props::NAMESPC_BACKUP_SHIPPING,
                limit.to_string(),
            );
        }
        state.nodes.insert(name.to_string(), node);
    }
    state
        .remotes
        .insert("s3".to_string(), Remote::object_store("s3", "bucket"));
    state
        .remotes
        .insert("dr".to_string(), Remote::peer_cluster("dr", "https://dr.example:3371"));
    state
}

pub fn add_resource(state: &mut ClusterState, rsc: &str, nodes: &[&str], volumes: &[(u32, u64)]) {
    let mut rsc_dfn = ResourceDefinition::new(rsc);
    for (number, size_kib) in volumes {
        rsc_dfn.volumes.insert(
            *number,
            VolumeDefinition {
                number: *number,
                size_kib: *size_kib,
            },
        );
    }
    for node in nodes {
        rsc_dfn.resources.insert(
            node.to_string(),
            Resource {
                node_name: node.to_string(),
                diskless: false,
            },
        );
    }
    state.rsc_dfns.insert(rsc.to_string(), rsc_dfn);
}

/// Snapshot with instances on `nodes`, volume sizes taken from the resource.
pub fn add_snapshot(state: &mut ClusterState, rsc: &str, snap: &str, nodes: &[&str]) -> Uuid {
    let rsc_dfn = state.rsc_dfns.get_mut(rsc).unwrap();
    let mut snap_dfn = SnapshotDefinition::new(rsc, snap);
    snap_dfn.volume_sizes = rsc_dfn.volume_sizes();
    for node in nodes {
        snap_dfn
            .snapshots
            .insert(node.to_string(), Snapshot::new(*node));
    }
    let uuid = snap_dfn.uuid;
    rsc_dfn.snapshot_dfns.insert(snap.to_string(), snap_dfn);
    uuid
}

/// Flags a snapshot as shipping from `node` to `remote`.
pub fn mark_shipping(state: &mut ClusterState, rsc: &str, snap: &str, node: &str, remote: &str) {
    let snap_dfn = state.snap_dfn_mut(rsc, snap).unwrap();
    snap_dfn.flags.shipping = true;
    snap_dfn.flags.backup = true;
    snap_dfn
        .props
        .set(props::KEY_SOURCE_NODE, &props::remote_namespace(remote), node);
    let snapshot = snap_dfn.snapshots.get_mut(node).unwrap();
    snapshot.flags.backup_source = true;
    snapshot
        .props
        .set(props::KEY_TARGET_REMOTE, props::NAMESPC_BACKUP_SHIPPING, remote);
}

/// Manifest of `<rsc>_back_<ts>` with one data object per volume.
pub fn manifest(rsc: &str, ts: &str, based_on: Option<&str>, volumes: &[u32]) -> BackupManifest {
    let timestamp = key::parse_timestamp(ts).unwrap();
    let at = Utc.from_utc_datetime(&timestamp);
    let backups = volumes
        .iter()
        .map(|vlm| {
            (
                *vlm,
                vec![DataObjectInfo {
                    name: format!("{rsc}_vol{vlm}_{ts}"),
                    finished_timestamp: at,
                    size: Some(1024),
                }],
            )
        })
        .collect();
    BackupManifest {
        rsc_name: rsc.to_string(),
        snap_name: key::default_snap_name(&timestamp),
        node_name: "n1".to_string(),
        start: at,
        finish: at,
        based_on: based_on.map(String::from),
        cluster_id: "cluster-a".to_string(),
        snap_dfn_uuid: None,
        backups,
        volume_sizes: volumes.iter().map(|vlm| (*vlm, 1024)).collect(),
    }
}

pub fn listing(entries: Vec<(&str, Option<BackupManifest>)>) -> RemoteListing {
    let mut listing = RemoteListing::default();
    for (key, manifest) in entries {
        listing.keys.insert(key.to_string());
        if let Some(manifest) = manifest {
            listing.manifests.insert(key.to_string(), manifest);
        }
    }
    listing
}

/// Records notified nodes; configured nodes fail.
#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<String>>,
    failing: BTreeSet<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(nodes: &[&str]) -> Self {
        Self {
            notified: Mutex::new(Vec::new()),
            failing: nodes.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Successfully notified nodes, sorted.
    pub async fn notified(&self) -> Vec<String> {
        let mut notified = self.notified.lock().await.clone();
        notified.sort();
        notified
    }
}

#[async_trait]
impl SatelliteNotifier for RecordingNotifier {
    async fn notify(&self, node: &str) -> Result<(), TransportError> {
        if self.failing.contains(node) {
            return Err(TransportError::Unreachable(node.to_string()));
        }
        self.notified.lock().await.push(node.to_string());
        Ok(())
    }
}

/// Peer cluster answering every placement request the same way, optionally only after `open()`.
pub struct ScriptedPeer {
    answer: Result<PlacementContext, TransportError>,
    gate: Option<Semaphore>,
    pub requests: Mutex<Vec<PlacementRequest>>,
    pub announced: Mutex<Vec<(ShipmentKey, String)>>,
}

impl ScriptedPeer {
    pub fn answering(answer: PlacementContext) -> Self {
        Self {
            answer: Ok(answer),
            gate: None,
            requests: Mutex::new(Vec::new()),
            announced: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            answer: Err(TransportError::Unreachable("dr".to_string())),
            ..Self::answering(PlacementContext::default())
        }
    }

    /// Holds every placement answer back until [`ScriptedPeer::open`] is called.
    pub fn gated(answer: PlacementContext) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::answering(answer)
        }
    }

    pub fn open(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl PeerClusterTransport for ScriptedPeer {
    async fn request_placement(
        &self,
        _remote_name: &str,
        request: PlacementRequest,
    ) -> Result<PlacementContext, TransportError> {
        self.requests.lock().await.push(request);
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.unwrap();
            permit.forget();
        }
        self.answer.clone()
    }

    async fn announce_shipment(
        &self,
        _remote_name: &str,
        key: &ShipmentKey,
        source_node: &str,
    ) -> Result<ConnectionInfo, TransportError> {
        self.announced
            .lock()
            .await
            .push((key.clone(), source_node.to_string()));
        Ok(ConnectionInfo {
            target_node: "far-1".to_string(),
            ip: "10.0.0.1".to_string(),
            port: 12000,
        })
    }
}

/// Manifest the satellite would upload for a finished shipment of `rsc/snap`.
pub fn manifest_for(state: &ClusterState, rsc: &str, snap: &str, based_on: Option<&str>) -> (String, BackupManifest) {
    let snap_dfn = state.snap_dfn(rsc, snap).unwrap();
    let ts = snap_dfn.start_timestamp().unwrap().to_string();
    let backup_key = key::BackupKey::manifest(rsc, key::parse_timestamp(&ts).unwrap(), None, Some(snap.to_string()));
    let mut manifest = manifest(rsc, &ts, based_on, &snap_dfn.volume_sizes.keys().copied().collect::<Vec<_>>());
    manifest.snap_name = snap.to_string();
    manifest.snap_dfn_uuid = Some(snap_dfn.uuid);
    for (vlm, infos) in manifest.backups.iter_mut() {
        for info in infos {
            info.name = backup_key.data(*vlm).to_string();
        }
    }
    let sizes: BTreeMap<u32, u64> = snap_dfn.volume_sizes.clone();
    manifest.volume_sizes = sizes;
    (backup_key.to_string(), manifest)
}
