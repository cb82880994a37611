//! Backup targets.
//!
//! A remote is one of three closed variants. Operations that only make sense for some kinds ask
//! [`RemoteKind`] instead of matching on the remote directly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteKind {
    ObjectStore,
    PeerCluster,
    Satellite,
}

impl RemoteKind {
    /// Whether backups on this remote can be listed, inspected and deleted from here.
    pub fn supports_listing(self) -> bool {
        matches!(self, RemoteKind::ObjectStore)
    }

    /// Whether this cluster can start a shipment to this kind of remote.
    pub fn accepts_shipments(self) -> bool {
        matches!(self, RemoteKind::ObjectStore | RemoteKind::PeerCluster)
    }

    /// Whether the destination decides placement (cross-cluster handshake).
    pub fn needs_placement(self) -> bool {
        matches!(self, RemoteKind::PeerCluster)
    }

    pub fn required_tools(self) -> &'static [&'static str] {
        match self {
            RemoteKind::ObjectStore => &[],
            RemoteKind::PeerCluster | RemoteKind::Satellite => &["socat"],
        }
    }

    pub fn optional_tools(self) -> &'static [&'static str] {
        match self {
            RemoteKind::ObjectStore => &[],
            RemoteKind::PeerCluster | RemoteKind::Satellite => &["zstd"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreRemote {
    pub name: String,
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub marked_for_deletion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerClusterRemote {
    pub name: String,
    pub url: String,
    /// Identity of the far cluster, learned during the first handshake
    pub cluster_id: Option<Uuid>,
    pub marked_for_deletion: bool,
}

/// Short-lived remote standing for a receiving satellite during a cross-cluster shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteRemote {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub marked_for_deletion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Remote {
    ObjectStore(ObjectStoreRemote),
    PeerCluster(PeerClusterRemote),
    Satellite(SatelliteRemote),
}

impl Remote {
    pub fn name(&self) -> &str {
        match self {
            Remote::ObjectStore(r) => &r.name,
            Remote::PeerCluster(r) => &r.name,
            Remote::Satellite(r) => &r.name,
        }
    }

    pub fn kind(&self) -> RemoteKind {
        match self {
            Remote::ObjectStore(_) => RemoteKind::ObjectStore,
            Remote::PeerCluster(_) => RemoteKind::PeerCluster,
            Remote::Satellite(_) => RemoteKind::Satellite,
        }
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        match self {
            Remote::ObjectStore(r) => r.marked_for_deletion,
            Remote::PeerCluster(r) => r.marked_for_deletion,
            Remote::Satellite(r) => r.marked_for_deletion,
        }
    }

    pub fn mark_for_deletion(&mut self) {
        match self {
            Remote::ObjectStore(r) => r.marked_for_deletion = true,
            Remote::PeerCluster(r) => r.marked_for_deletion = true,
            Remote::Satellite(r) => r.marked_for_deletion = true,
        }
    }

    pub fn object_store(name: impl Into<String>, bucket: impl Into<String>) -> Self {
        Remote::ObjectStore(ObjectStoreRemote {
            name: name.into(),
            endpoint: String::new(),
            bucket: bucket.into(),
            region: String::new(),
            marked_for_deletion: false,
        })
    }

    pub fn peer_cluster(name: impl Into<String>, url: impl Into<String>) -> Self {
        Remote::PeerCluster(PeerClusterRemote {
            name: name.into(),
            url: url.into(),
            cluster_id: None,
            marked_for_deletion: false,
        })
    }
}
