//! Logical backup listing.
//!
//! Reconciles three sources into one map keyed by backup id:
//! manifests from the graph, data objects without a manifest, and shipments that started locally
//! but are not visible in the listing yet.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::graph::BackupGraph;
use crate::key::{self, BackupKey};
use crate::models::ClusterState;
use crate::store::RemoteListing;

#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub rsc_name: Option<String>,
    pub snap_name: Option<String>,
}

impl CatalogFilter {
    pub fn matches(&self, rsc_name: &str, snap_name: &str) -> bool {
        self.rsc_name.as_deref().map_or(true, |r| r == rsc_name)
            && self.snap_name.as_deref().map_or(true, |s| s == snap_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSummary {
    pub key: String,
    pub size: Option<u64>,
    pub restorable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub id: String,
    pub rsc_name: String,
    pub snap_name: String,
    pub timestamp: NaiveDateTime,
    pub suffix: Option<String>,
    pub manifest_key: Option<String>,
    pub based_on_id: Option<String>,
    pub node_name: Option<String>,
    pub cluster_id: Option<String>,
    pub finished: Option<DateTime<Utc>>,
    pub volumes: BTreeMap<u32, VolumeSummary>,
    pub restorable: bool,
    /// `None` when no local snapshot tells us
    pub shipping: Option<bool>,
    pub success: Option<bool>,
}

impl BackupSummary {
    fn from_key(key: &BackupKey) -> Self {
        Self {
            id: key.backup_id(),
            rsc_name: key.rsc_name.clone(),
            snap_name: key.snap_name.clone(),
            timestamp: key.timestamp,
            suffix: key.suffix.clone(),
            manifest_key: None,
            based_on_id: None,
            node_name: None,
            cluster_id: None,
            finished: None,
            volumes: BTreeMap::new(),
            restorable: false,
            shipping: None,
            success: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CatalogListing {
    pub backups: BTreeMap<String, BackupSummary>,
    /// Keys in the listing that are not backup objects at all
    pub unrecognized: BTreeSet<String>,
}

pub fn list(
    listing: &RemoteListing,
    graph: &BackupGraph,
    state: &ClusterState,
    remote_name: &str,
    filter: &CatalogFilter,
) -> CatalogListing {
    let mut remaining: BTreeSet<&str> = listing.keys.iter().map(String::as_str).collect();
    let mut backups = BTreeMap::new();

    // manifests
    for node in graph.manifests() {
        let (Some(manifest), Some(manifest_key)) = (&node.manifest, key::parse_manifest_key(&node.key))
        else {
            continue;
        };
        if !filter.matches(&manifest_key.rsc_name, &manifest_key.snap_name) {
            continue;
        }
        remaining.remove(node.key.as_str());

        let mut summary = BackupSummary::from_key(&manifest_key);
        summary.manifest_key = Some(node.key.clone());
        summary.based_on_id = manifest
            .based_on_key()
            .map(|k| k.backup_id())
            .or_else(|| manifest.based_on.clone());
        summary.node_name = Some(manifest.node_name.clone());
        summary.cluster_id = Some(manifest.cluster_id.clone());
        summary.finished = Some(manifest.finish);
        summary.shipping = Some(false);
        summary.success = Some(true);
        summary.restorable = true;

        for (vlm_nr, infos) in &manifest.backups {
            for info in infos {
                let present = graph.node(&info.name).is_some_and(|n| n.exists);
                let volume_matches = key::parse_data_key(&info.name)
                    .is_some_and(|k| k.volume == Some(*vlm_nr));
                let restorable = present && volume_matches;
                if present {
                    remaining.remove(info.name.as_str());
                }
                summary.restorable &= restorable;
                summary.volumes.insert(
                    *vlm_nr,
                    VolumeSummary {
                        key: info.name.clone(),
                        size: info.size,
                        restorable,
                    },
                );
            }
        }
        backups.insert(summary.id.clone(), summary);
    }

    // data objects without a manifest
    for key_str in &remaining {
        let Some(data_key) = key::parse_data_key(key_str) else {
            continue;
        };
        if !filter.matches(&data_key.rsc_name, &data_key.snap_name) {
            continue;
        }
        let id = data_key.backup_id();
        let summary = backups.entry(id).or_insert_with(|| {
            let mut summary = BackupSummary::from_key(&data_key);
            let (shipping, success) = local_status(state, &data_key.rsc_name, &data_key.snap_name);
            summary.shipping = shipping;
            summary.success = success;
            summary
        });
        if summary.manifest_key.is_some() {
            continue;
        }
        if let Some(vlm_nr) = data_key.volume {
            summary.volumes.insert(
                vlm_nr,
                VolumeSummary {
                    key: key_str.to_string(),
                    size: None,
                    restorable: false,
                },
            );
        }
    }

    // shipments the listing has not caught up with yet
    for rsc_dfn in state.rsc_dfns.values() {
        for snap_dfn in rsc_dfn.snapshot_dfns.values() {
            if !snap_dfn.is_shipping_backup()
                || snap_dfn.target_remote() != Some(remote_name)
                || !filter.matches(&snap_dfn.rsc_name, &snap_dfn.name)
            {
                continue;
            }
            let Some(timestamp) = snap_dfn.start_timestamp().and_then(key::parse_timestamp) else {
                continue;
            };
            let future = BackupKey::manifest(
                &snap_dfn.rsc_name,
                timestamp,
                snap_dfn.site_suffix().map(String::from),
                Some(snap_dfn.name.clone()),
            );
            let id = future.backup_id();
            if backups.contains_key(&id) {
                continue;
            }
            debug!(backup = %id, "Adding in-flight shipment to listing");
            let mut summary = BackupSummary::from_key(&future);
            summary.shipping = Some(true);
            summary.node_name = snap_dfn.source_node(remote_name).map(String::from);
            for vlm_nr in snap_dfn.volume_sizes.keys() {
                summary.volumes.insert(
                    *vlm_nr,
                    VolumeSummary {
                        key: future.data(*vlm_nr).to_string(),
                        size: None,
                        restorable: false,
                    },
                );
            }
            backups.insert(id, summary);
        }
    }

    CatalogListing {
        backups,
        unrecognized: remaining
            .into_iter()
            .filter(|k| key::parse_key(k).is_none())
            .map(String::from)
            .collect(),
    }
}

/// Shipping status of a manifest-less backup as far as the local snapshot knows.
fn local_status(state: &ClusterState, rsc_name: &str, snap_name: &str) -> (Option<bool>, Option<bool>) {
    match state.snap_dfn(rsc_name, snap_name) {
        Some(snap_dfn) if snap_dfn.flags.shipping => (Some(true), None),
        Some(snap_dfn) if snap_dfn.flags.shipped => (Some(false), Some(true)),
        Some(_) => (Some(false), Some(false)),
        None => (None, None),
    }
}

/// Newest manifest key among `keys`, optionally restricted to one snapshot name.
pub fn latest<'a, I>(keys: I, snap_filter: Option<&str>) -> Option<BackupKey>
where
    I: IntoIterator<Item = &'a str>,
{
    keys.into_iter()
        .filter_map(key::parse_manifest_key)
        .filter(|k| snap_filter.map_or(true, |s| k.snap_name == s))
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp))
}
