//! Incremental base resolution.
//!
//! Every check here degrades to "no base" (a full backup) instead of failing. A wrong base would
//! corrupt the lineage on the remote, a missing one only costs bandwidth.

use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::graph::BackupGraph;
use crate::models::{ClusterState, RemoteKind, ResourceDefinition, SnapshotDefinition};
use crate::utils::errors::{Result, ShippingError};

/// Which per-remote property names the previous backup of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseSource {
    /// Newest shipment that was started or queued, used for new requests
    LastStartedOrQueued,
    /// Newest shipment that completed, used when a queued item has to re-resolve
    LastShipped,
}

/// Base snapshot for a new shipment of `rsc_name` to `remote_name`, or `None` for a full backup.
///
/// `graph` is the current listing of an object-store remote. Without it a shipped candidate is
/// not cross-checked against the remote.
pub fn resolve_local_base(
    state: &ClusterState,
    graph: Option<&BackupGraph>,
    rsc_name: &str,
    remote_name: &str,
    allow_incremental: bool,
    source: BaseSource,
) -> Option<String> {
    if !allow_incremental {
        return None;
    }
    let rsc_dfn = state.rsc_dfns.get(rsc_name)?;
    let prev_name = match source {
        BaseSource::LastStartedOrQueued => rsc_dfn.last_started_or_queued(remote_name),
        BaseSource::LastShipped => rsc_dfn.last_shipped(remote_name),
    }?;

    let Some(candidate) = rsc_dfn.snapshot_dfns.get(prev_name) else {
        warn!(
            resource = %rsc_name,
            snapshot = %prev_name,
            "Previous snapshot no longer exists, shipping a full backup"
        );
        return None;
    };
    if candidate.is_deleted() {
        warn!(
            resource = %rsc_name,
            snapshot = %prev_name,
            "Previous snapshot is being deleted, shipping a full backup"
        );
        return None;
    }

    let is_object_store = state
        .remotes
        .get(remote_name)
        .is_some_and(|r| r.kind() == RemoteKind::ObjectStore);
    if is_object_store && candidate.flags.shipped {
        if let Some(graph) = graph {
            if graph.manifest_for_snapshot(rsc_name, prev_name).is_none() {
                warn!(
                    resource = %rsc_name,
                    snapshot = %prev_name,
                    remote = %remote_name,
                    "Backup of previous snapshot is gone from the remote, shipping a full backup"
                );
                return None;
            }
        }
    }

    if !sizes_match(rsc_dfn, candidate) {
        return None;
    }
    Some(prev_name.to_string())
}

/// Every current volume must have been recorded with exactly the same size.
fn sizes_match(rsc_dfn: &ResourceDefinition, candidate: &SnapshotDefinition) -> bool {
    for vlm in rsc_dfn.volumes.values() {
        let recorded = candidate.volume_sizes.get(&vlm.number).copied();
        if recorded != Some(vlm.size_kib) {
            debug!(
                resource = %rsc_dfn.name,
                snapshot = %candidate.name,
                volume = vlm.number,
                current = vlm.size_kib,
                recorded = ?recorded,
                "Volume size changed since previous snapshot"
            );
            return false;
        }
    }
    true
}

/// Base chosen on the receiving side of a cross-cluster shipment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBase {
    pub snap_name: String,
    pub node_name: String,
    /// Identity of the snapshot on the sending cluster
    pub source_uuid: Uuid,
}

/// Picks the newest received snapshot whose source identity is in `candidate_uuids`.
///
/// With `preferred_node` only instances on that node count, however old. Otherwise each
/// candidate must have an instance somewhere; one without any is a broken invariant.
pub fn resolve_remote_base(
    rsc_dfn: &ResourceDefinition,
    candidate_uuids: &BTreeSet<Uuid>,
    preferred_node: Option<&str>,
) -> Result<Option<RemoteBase>> {
    let mut best: Option<(&str, RemoteBase)> = None;

    for snap_dfn in rsc_dfn.snapshot_dfns.values() {
        if snap_dfn.is_deleted() {
            continue;
        }
        let Some(source_uuid) = snap_dfn.source_snap_dfn_uuid() else {
            continue;
        };
        if !candidate_uuids.contains(&source_uuid) {
            continue;
        }

        let node_name = match preferred_node {
            Some(node) => match snap_dfn.snapshot_on(node) {
                Some(snap) => snap.node_name.clone(),
                None => continue,
            },
            None => match snap_dfn.snapshots.values().next() {
                Some(snap) => snap.node_name.clone(),
                None => {
                    return Err(ShippingError::Internal(format!(
                        "snapshot '{}' of resource '{}' has no instance",
                        snap_dfn.name, rsc_dfn.name
                    )))
                }
            },
        };

        let start = snap_dfn.start_timestamp().unwrap_or_default();
        if best.as_ref().map_or(true, |(best_start, _)| start > *best_start) {
            best = Some((
                start,
                RemoteBase {
                    snap_name: snap_dfn.name.clone(),
                    node_name,
                    source_uuid,
                },
            ));
        }
    }
    Ok(best.map(|(_, base)| base))
}
