//! Produced interface of the backup shipping core.
//!
//! Every method follows the same pipeline: read what is needed in a scope, talk to remotes with
//! no lock held, act on the result in a new write scope, then notify satellites. Cross-cluster
//! handshakes are continuations keyed by [`ShipmentKey`] and re-check for an abort after every
//! await.

use chrono::{NaiveDateTime, SubsecRound, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{self, CatalogFilter, CatalogListing};
use crate::chain;
use crate::config::Config;
use crate::graph::{BackupGraph, DeletionPlan};
use crate::key;
use crate::models::props;
use crate::models::{ClusterState, PlacementContext, RemoteKind, ShipmentKey, ShipmentRequest};
use crate::notify::{self, PeerClusterTransport, PlacementRequest, SatelliteNotifier};
use crate::report::{Report, Reported};
use crate::scheduler::{self, SchedulerOutcome, Submitted};
use crate::scope::ClusterStore;
use crate::selector;
use crate::store::{ObjectStore, RemoteListing};
use crate::utils::errors::{Result, ShippingError};
use crate::utils::logger;

/// A user request to back up a resource.
#[derive(Debug, Clone)]
pub struct CreateBackup {
    pub rsc_name: String,
    pub remote_name: String,
    /// Generated as `back_<timestamp>` when absent
    pub snap_name: Option<String>,
    pub preferred_node: Option<String>,
    pub schedule: Option<String>,
    pub allow_incremental: bool,
}

impl CreateBackup {
    pub fn new(rsc_name: impl Into<String>, remote_name: impl Into<String>) -> Self {
        Self {
            rsc_name: rsc_name.into(),
            remote_name: remote_name.into(),
            snap_name: None,
            preferred_node: None,
            schedule: None,
            allow_incremental: true,
        }
    }
}

/// Which backups a delete request addresses.
#[derive(Debug, Clone)]
pub enum DeleteSelection {
    /// Exact backup id, `.meta` is appended
    Id(String),
    /// Unique id prefix
    IdPrefix(String),
    /// Exact object key
    Key(String),
    /// Manifests matching every given criterion
    Filter {
        /// `YYYYMMDD_HHMMSS`, strictly older backups match
        older_than: Option<String>,
        rsc_name: Option<String>,
        node_name: Option<String>,
    },
    /// Every backup object, cascading
    All,
    /// Every backup uploaded by this cluster, cascading
    AllLocalCluster,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteFlags {
    pub cascade: bool,
    pub dry_run: bool,
    pub keep_local_snapshots: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub dry_run: bool,
    pub deleted: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub not_found: BTreeSet<String>,
    /// Local snapshots marked for deletion, as `<rsc>/<snap>`
    pub local_snapshots: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub id: String,
    /// Backup ids from the full backup up to `id`
    pub chain: Vec<String>,
    /// Sum of known data object sizes over the whole chain
    pub total_size: u64,
    /// Manifests or data objects of the chain missing on the remote
    pub missing: Vec<String>,
    pub restorable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    pub target_rsc: String,
    /// Manifest keys in download order, full backup first
    pub downloads: Vec<String>,
}

pub struct ShippingService {
    cluster: ClusterStore,
    object_stores: DashMap<String, Arc<dyn ObjectStore>>,
    notifier: Arc<dyn SatelliteNotifier>,
    peer: Arc<dyn PeerClusterTransport>,
    /// Cross-cluster handshakes waiting for the destination's answer
    handshakes: DashMap<ShipmentKey, NaiveDateTime>,
}

impl ShippingService {
    pub fn new(
        state: ClusterState,
        notifier: Arc<dyn SatelliteNotifier>,
        peer: Arc<dyn PeerClusterTransport>,
    ) -> Self {
        Self {
            cluster: ClusterStore::new(state),
            object_stores: DashMap::new(),
            notifier,
            peer,
            handshakes: DashMap::new(),
        }
    }

    /// Empty cluster seeded with the configured identity and controller properties.
    pub fn from_config(
        config: &Config,
        notifier: Arc<dyn SatelliteNotifier>,
        peer: Arc<dyn PeerClusterTransport>,
    ) -> Self {
        let mut state = ClusterState::new(config.cluster.id.clone());
        state.ctrl_props = config.controller_props();
        info!(cluster = %state.cluster_id, "Shipping service initialized");
        Self::new(state, notifier, peer)
    }

    /// Entry point for an embedding controller: loads the config file (or defaults), applies
    /// environment overrides, installs logging at the configured level and builds the service.
    pub fn bootstrap(
        config_path: Option<&Path>,
        notifier: Arc<dyn SatelliteNotifier>,
        peer: Arc<dyn PeerClusterTransport>,
    ) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        }
        .apply_env_overrides();
        if !logger::init(&config.log) {
            debug!("Tracing subscriber already installed, keeping it");
        }
        Ok(Self::from_config(&config, notifier, peer))
    }

    pub fn cluster(&self) -> &ClusterStore {
        &self.cluster
    }

    /// Registers the client used for an object-store remote.
    pub fn register_object_store(&self, remote_name: impl Into<String>, store: Arc<dyn ObjectStore>) {
        self.object_stores.insert(remote_name.into(), store);
    }

    pub fn pending_handshakes(&self) -> Vec<ShipmentKey> {
        self.handshakes.iter().map(|e| e.key().clone()).collect()
    }

    fn object_store(&self, remote_name: &str) -> Result<Arc<dyn ObjectStore>> {
        self.object_stores
            .get(remote_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ShippingError::InvalidRemote(format!("no object store client for remote '{remote_name}'"))
            })
    }

    async fn remote_kind(&self, remote_name: &str) -> Result<RemoteKind> {
        let remote_name = remote_name.to_string();
        self.cluster
            .read("remote-kind", move |state| Ok(state.remote(&remote_name)?.kind()))
            .await
    }

    /// Store client of a listable remote.
    async fn listable_store(&self, remote_name: &str) -> Result<Arc<dyn ObjectStore>> {
        if !self.remote_kind(remote_name).await?.supports_listing() {
            return Err(ShippingError::InvalidRemote(format!(
                "backups on remote '{remote_name}' cannot be listed from here"
            )));
        }
        self.object_store(remote_name)
    }

    async fn fetch(&self, store: &dyn ObjectStore, prefix: &str, report: &mut Report) -> Result<RemoteListing> {
        let listing = RemoteListing::fetch(store, prefix).await?;
        for issue in &listing.issues {
            report.warn(format!("Skipped '{}': {}", issue.key, issue.error));
        }
        Ok(listing)
    }

    /// Notifies satellites and announces started cross-cluster shipments.
    async fn dispatch(&self, outcome: &SchedulerOutcome, report: &mut Report) -> Result<()> {
        for started in &outcome.started {
            report.info(format!("Shipment {} started on node '{}'", started.key, started.node));
        }
        for key in &outcome.queued {
            report.info(format!("Shipment {key} queued"));
        }
        for key in &outcome.aborted {
            report.info(format!("Shipment {key} aborted"));
        }
        for (key, reason) in &outcome.dropped {
            report.warn(format!("Shipment {key} dropped: {reason}"));
        }

        for (node, result) in notify::notify_all(self.notifier.as_ref(), &outcome.notify).await {
            if let Err(err) = result {
                warn!(node = %node, error = %err, "Satellite notification failed");
                report.warn(format!("Node '{node}' could not be notified: {err}"));
            }
        }

        for started in &outcome.started {
            if self.remote_kind(&started.key.remote_name).await? != RemoteKind::PeerCluster {
                continue;
            }
            self.announce(&started.key, &started.node, report).await?;
        }
        Ok(())
    }

    async fn announce(&self, key: &ShipmentKey, node: &str, report: &mut Report) -> Result<()> {
        let answer = self.peer.announce_shipment(&key.remote_name, key, node).await;

        let key_clone = key.clone();
        let failed = answer.is_err();
        let aborted = self
            .cluster
            .write("announce-shipment", move |state| {
                let snap_dfn = state.snap_dfn_mut(&key_clone.rsc_name, &key_clone.snap_name)?;
                if failed && snap_dfn.is_shipping_backup() {
                    snap_dfn.flags.shipping_abort = true;
                }
                Ok(snap_dfn.flags.shipping_abort)
            })
            .await?;

        match answer {
            Ok(info) => {
                report.info(format!(
                    "Shipment {key} is received by node '{}' at {}:{}",
                    info.target_node, info.ip, info.port
                ));
                if aborted {
                    report.warn(format!("Shipment {key} was aborted while connecting"));
                }
            }
            Err(err) => {
                warn!(shipment = %key, error = %err, "Announcing shipment failed, aborting");
                report.error(format!("Shipment {key} could not be announced: {err}"));
                let mut notify = BTreeSet::new();
                notify.insert(node.to_string());
                for (node, result) in notify::notify_all(self.notifier.as_ref(), &notify).await {
                    if let Err(err) = result {
                        report.warn(format!("Node '{node}' could not be notified: {err}"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Creates a backup snapshot and starts or queues its shipment.
    pub async fn create_backup(&self, request: CreateBackup) -> Result<Reported<Submitted>> {
        let mut report = Report::new();
        let now = Utc::now().naive_utc().trunc_subsecs(0);
        let snap_name = request
            .snap_name
            .clone()
            .unwrap_or_else(|| key::default_snap_name(&now));

        let mut ship = ShipmentRequest::new(&request.rsc_name, snap_name, &request.remote_name);
        ship.preferred_node = request.preferred_node.clone();
        ship.schedule = request.schedule.clone();
        ship.allow_incremental = request.allow_incremental;

        let mut graph = None;
        if self.remote_kind(&request.remote_name).await? == RemoteKind::ObjectStore && ship.allow_incremental {
            let store = self.object_store(&request.remote_name)?;
            match self.fetch(store.as_ref(), &format!("{}_", request.rsc_name), &mut report).await {
                Ok(listing) => graph = Some(BackupGraph::build(&listing)),
                Err(err) => {
                    warn!(remote = %request.remote_name, error = %err, "Listing failed, shipping a full backup");
                    report.warn(format!("Could not verify previous backups ({err}), shipping a full backup"));
                    ship.allow_incremental = false;
                }
            }
        }

        let (submitted, warnings) = self
            .cluster
            .write("create-backup", move |state| {
                let mut warnings = Vec::new();
                if let Some(graph) = graph.as_mut() {
                    warnings = graph.associate_snapshots(state);
                }
                let submitted = scheduler::submit(state, ship, graph.as_ref(), now)?;
                Ok((submitted, warnings))
            })
            .await?;
        for warning in warnings {
            report.warn(warning);
        }
        match &submitted.prev_snap {
            Some(prev) => report.info(format!(
                "Backup {} is incremental to snapshot '{prev}'",
                submitted.backup_key.backup_id()
            )),
            None => report.info(format!("Backup {} is a full backup", submitted.backup_key.backup_id())),
        }

        self.dispatch(&submitted.outcome, &mut report).await?;

        if submitted.awaiting_placement {
            let handshake = self.placement_handshake(&submitted.key).await?;
            report.merge(handshake);
        }
        Ok(Reported::new(submitted, report))
    }

    /// Source side of a cross-cluster shipment: ask the destination for placement, then admit.
    async fn placement_handshake(&self, key: &ShipmentKey) -> Result<Report> {
        let mut report = Report::new();
        let key_clone = key.clone();
        let request = self
            .cluster
            .read("placement-request", move |state| {
                let Some(item) = state.queues.get(&key_clone) else {
                    return Ok(None);
                };
                let rsc_dfn = state.rsc_dfn(&key_clone.rsc_name)?;
                let snap_dfn = state.snap_dfn(&key_clone.rsc_name, &key_clone.snap_name).ok_or_else(|| {
                    ShippingError::NotFound(format!("snapshot definition '{}'", key_clone.snap_name))
                })?;
                let base_candidates = rsc_dfn
                    .snapshot_dfns
                    .values()
                    .filter(|s| {
                        s.flags.shipped && !s.is_deleted() && s.source_node(&key_clone.remote_name).is_some()
                    })
                    .map(|s| s.uuid)
                    .collect();
                Ok(Some(PlacementRequest {
                    key: key_clone.clone(),
                    src_cluster_id: state.cluster_id.clone(),
                    base_candidates,
                    volume_sizes: snap_dfn.volume_sizes.clone(),
                    preferred_node: item.request.preferred_node.clone(),
                }))
            })
            .await?;
        let Some(request) = request else {
            report.warn(format!("Shipment {key} was aborted before the handshake"));
            return Ok(report);
        };

        info!(shipment = %key, "Requesting placement from peer cluster");
        self.handshakes.insert(key.clone(), Utc::now().naive_utc());
        let answer = self.peer.request_placement(&key.remote_name, request).await;
        self.handshakes.remove(key);

        match answer {
            Ok(placement) => {
                let decided = self.placement_decided(key, placement).await?;
                report.merge(decided.report);
            }
            Err(err) => {
                warn!(shipment = %key, error = %err, "Placement request failed");
                report.error(format!("Peer cluster did not decide placement for {key}: {err}"));
                let key_clone = key.clone();
                let outcome = self
                    .cluster
                    .write("placement-failed", move |state| scheduler::cancel_queued(state, &key_clone))
                    .await?;
                self.dispatch(&outcome, &mut report).await?;
            }
        }
        Ok(report)
    }

    /// Continuation of a cross-cluster shipment once the destination decided placement.
    pub async fn placement_decided(
        &self,
        key: &ShipmentKey,
        placement: PlacementContext,
    ) -> Result<Reported<SchedulerOutcome>> {
        let mut report = Report::new();
        let key_clone = key.clone();
        let outcome = self
            .cluster
            .write("placement-decided", move |state| {
                let aborted = state
                    .snap_dfn(&key_clone.rsc_name, &key_clone.snap_name)
                    .map_or(true, |s| s.flags.shipping_abort || s.is_deleted());
                if aborted || !state.queues.is_queued(&key_clone) {
                    return Ok(None);
                }
                scheduler::on_placement_decided(state, &key_clone, placement).map(Some)
            })
            .await?;

        let Some(outcome) = outcome else {
            report.warn(format!("Shipment {key} was aborted during the handshake"));
            return Ok(Reported::new(SchedulerOutcome::default(), report));
        };
        self.dispatch(&outcome, &mut report).await?;
        Ok(Reported::new(outcome, report))
    }

    /// Completion reported by the source node of a shipment.
    pub async fn shipping_finished(
        &self,
        rsc_name: &str,
        snap_name: &str,
        node: &str,
        success: bool,
    ) -> Result<Reported<SchedulerOutcome>> {
        let (rsc, snap, node) = (rsc_name.to_string(), snap_name.to_string(), node.to_string());
        let outcome = self
            .cluster
            .write("shipping-finished", move |state| {
                scheduler::shipping_finished(state, &rsc, &snap, &node, success)
            })
            .await?;
        let mut report = Report::new();
        self.dispatch(&outcome, &mut report).await?;
        Ok(Reported::new(outcome, report))
    }

    pub async fn node_removed(&self, node: &str) -> Result<Reported<SchedulerOutcome>> {
        let node = node.to_string();
        let outcome = self
            .cluster
            .write("node-removed", move |state| scheduler::on_node_removed(state, &node))
            .await?;
        let mut report = Report::new();
        self.dispatch(&outcome, &mut report).await?;
        Ok(Reported::new(outcome, report))
    }

    /// Sets (or with `None` clears) the shipment limit of a node, or the cluster default.
    pub async fn max_concurrency_changed(
        &self,
        node: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Reported<SchedulerOutcome>> {
        let node = node.map(String::from);
        let outcome = self
            .cluster
            .write("max-concurrency-changed", move |state| {
                let target = match &node {
                    Some(name) => &mut state.node_mut(name)?.props,
                    None => &mut state.ctrl_props,
                };
                match limit {
                    Some(limit) => {
                        target.set(
                            props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
                            props::NAMESPC_BACKUP_SHIPPING,
                            limit.to_string(),
                        );
                    }
                    None => {
                        target.remove(
                            props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
                            props::NAMESPC_BACKUP_SHIPPING,
                        );
                    }
                }
                scheduler::max_concurrency_changed(state, node.as_deref())
            })
            .await?;
        let mut report = Report::new();
        self.dispatch(&outcome, &mut report).await?;
        Ok(Reported::new(outcome, report))
    }

    pub async fn list_backups(&self, remote_name: &str, filter: CatalogFilter) -> Result<Reported<CatalogListing>> {
        let mut report = Report::new();
        let store = self.listable_store(remote_name).await?;
        let prefix = filter
            .rsc_name
            .as_ref()
            .map(|rsc| format!("{rsc}_"))
            .unwrap_or_default();
        let listing = self.fetch(store.as_ref(), &prefix, &mut report).await?;

        let remote = remote_name.to_string();
        let (catalog, warnings) = self
            .cluster
            .read("list-backups", move |state| {
                let mut graph = BackupGraph::build(&listing);
                let mut warnings = graph.associate_snapshots(state);
                warnings.extend(
                    graph
                        .dangling()
                        .into_iter()
                        .map(|k| format!("Referenced object '{k}' is missing")),
                );
                Ok((catalog::list(&listing, &graph, state, &remote, &filter), warnings))
            })
            .await?;
        for warning in warnings {
            report.warn(warning);
        }
        report.info(format!("{} backups found", catalog.backups.len()));
        Ok(Reported::new(catalog, report))
    }

    pub async fn delete_backup(
        &self,
        remote_name: &str,
        selection: DeleteSelection,
        flags: DeleteFlags,
    ) -> Result<Reported<DeleteResult>> {
        let mut report = Report::new();
        let store = self.listable_store(remote_name).await?;
        let listing = self.fetch(store.as_ref(), "", &mut report).await?;

        let plan = self
            .cluster
            .read("delete-backup-plan", move |state| {
                let mut graph = BackupGraph::build(&listing);
                graph.associate_snapshots(state);
                plan_deletion(state, &listing, &graph, &selection, flags)
            })
            .await?;

        let mut result = DeleteResult {
            dry_run: flags.dry_run,
            not_found: plan.not_found.clone(),
            ..Default::default()
        };
        for key in &plan.not_found {
            report.warn(format!("'{key}' not found on remote '{remote_name}'"));
        }
        if flags.dry_run {
            for key in &plan.keys {
                report.info(format!("Would delete '{key}'"));
            }
            result.deleted = plan.keys;
            if !flags.keep_local_snapshots {
                result.local_snapshots = plan
                    .snap_dfns
                    .iter()
                    .map(|s| format!("{}/{}", s.rsc_name, s.snap_name))
                    .collect();
            }
            return Ok(Reported::new(result, report));
        }

        if !plan.keys.is_empty() {
            let outcome = store.delete_keys(&plan.keys).await?;
            for key in &outcome.failed {
                report.error(format!("Failed to delete '{key}'"));
            }
            report.info(format!("Deleted {} objects from remote '{remote_name}'", outcome.deleted.len()));
            result.deleted = outcome.deleted;
            result.failed = outcome.failed;
        }

        if !flags.keep_local_snapshots && !plan.snap_dfns.is_empty() {
            let snap_refs = plan.snap_dfns.clone();
            let (outcome, marked) = self
                .cluster
                .write("delete-local-snapshots", move |state| {
                    let mut outcome = SchedulerOutcome::default();
                    let mut marked = BTreeSet::new();
                    for snap_ref in &snap_refs {
                        let Some(snap_dfn) = state.snap_dfn(&snap_ref.rsc_name, &snap_ref.snap_name) else {
                            continue;
                        };
                        if snap_dfn.is_deleted() || snap_dfn.is_shipping_backup() {
                            continue;
                        }
                        outcome.merge(scheduler::delete_snapshot(state, &snap_ref.rsc_name, &snap_ref.snap_name)?);
                        marked.insert(format!("{}/{}", snap_ref.rsc_name, snap_ref.snap_name));
                    }
                    Ok((outcome, marked))
                })
                .await?;
            for snap in &marked {
                report.info(format!("Local snapshot '{snap}' marked for deletion"));
            }
            result.local_snapshots = marked;
            self.dispatch(&outcome, &mut report).await?;
        }
        Ok(Reported::new(result, report))
    }

    pub async fn backup_info(&self, remote_name: &str, id: &str) -> Result<Reported<BackupInfo>> {
        let mut report = Report::new();
        let store = self.listable_store(remote_name).await?;
        let manifest_key = key::manifest_key_for_id(id);
        let backup_key = key::parse_manifest_key(&manifest_key)
            .ok_or_else(|| ShippingError::InvalidInput(format!("'{id}' is not a backup id")))?;
        let listing = self
            .fetch(store.as_ref(), &format!("{}_", backup_key.rsc_name), &mut report)
            .await?;

        let info = chain_info(&listing, &manifest_key)?;
        for missing in &info.missing {
            report.warn(format!("'{missing}' is missing"));
        }
        Ok(Reported::new(info, report))
    }

    /// Validates the chain of `id` and books a restore into `target_rsc`.
    pub async fn restore_backup(&self, remote_name: &str, id: &str, target_rsc: &str) -> Result<Reported<RestorePlan>> {
        let info = self.backup_info(remote_name, id).await?;
        let mut report = info.report;
        if !info.value.restorable {
            return Err(ShippingError::NotFound(format!(
                "backup '{id}' cannot be restored, missing: {}",
                info.value.missing.join(", ")
            )));
        }

        let target = target_rsc.to_string();
        self.cluster
            .write("restore-backup", move |state| {
                if state.restores.contains(&target) {
                    return Err(ShippingError::Conflict(format!("resource '{target}' is already being restored")));
                }
                if state
                    .rsc_dfns
                    .get(&target)
                    .is_some_and(|r| r.has_backup_in_progress())
                {
                    return Err(ShippingError::Conflict(format!("resource '{target}' has a backup in progress")));
                }
                state.restores.insert(target);
                Ok(())
            })
            .await?;

        let downloads = info
            .value
            .chain
            .iter()
            .map(|id| key::manifest_key_for_id(id))
            .collect();
        report.info(format!("Restoring '{id}' into resource '{target_rsc}'"));
        Ok(Reported::new(
            RestorePlan {
                target_rsc: target_rsc.to_string(),
                downloads,
            },
            report,
        ))
    }

    /// Clears the restore booking of `target_rsc`.
    pub async fn restore_finished(&self, target_rsc: &str) -> Result<()> {
        let target = target_rsc.to_string();
        self.cluster
            .write("restore-finished", move |state| {
                state.restores.remove(&target);
                Ok(())
            })
            .await
    }

    pub async fn abort_backup(&self, rsc_name: &str, remote_name: Option<&str>) -> Result<Reported<SchedulerOutcome>> {
        let rsc = rsc_name.to_string();
        let remote = remote_name.map(String::from);
        let outcome = self
            .cluster
            .write("abort-backup", move |state| scheduler::abort(state, &rsc, remote.as_deref()))
            .await?;
        let mut report = Report::new();
        if outcome.aborted.is_empty() {
            report.warn(format!("No shipment of resource '{rsc_name}' to abort"));
        }
        self.dispatch(&outcome, &mut report).await?;
        Ok(Reported::new(outcome, report))
    }

    pub async fn remote_marked_for_deletion(&self, remote_name: &str) -> Result<Reported<SchedulerOutcome>> {
        let remote = remote_name.to_string();
        let outcome = self
            .cluster
            .write("remote-deleted", move |state| scheduler::remote_marked_for_deletion(state, &remote))
            .await?;
        let mut report = Report::new();
        self.dispatch(&outcome, &mut report).await?;
        Ok(Reported::new(outcome, report))
    }

    /// Destination side of a cross-cluster shipment: pick a base and the receiving node.
    ///
    /// A preferred node this cluster does not know is ignored with a warning.
    pub async fn answer_placement_request(&self, request: PlacementRequest) -> Result<Reported<PlacementContext>> {
        self.cluster
            .read("answer-placement", move |state| {
                let mut report = Report::new();
                let preferred = match request.preferred_node.as_deref() {
                    Some(node) if !state.nodes.contains_key(node) => {
                        warn!(node = %node, shipment = %request.key, "Preferred target node does not exist");
                        report.warn(format!(
                            "Preferred target node '{node}' does not exist, choosing different node instead"
                        ));
                        None
                    }
                    preferred => preferred,
                };
                let (base, candidates) = match state.rsc_dfns.get(&request.key.rsc_name) {
                    Some(rsc_dfn) => (
                        chain::resolve_remote_base(rsc_dfn, &request.base_candidates, preferred)?,
                        rsc_dfn.diskful_nodes().map(String::from).collect(),
                    ),
                    None => (
                        None,
                        state
                            .nodes
                            .values()
                            .filter(|n| n.is_usable())
                            .map(|n| n.name.clone())
                            .collect::<BTreeSet<_>>(),
                    ),
                };
                let target_node = match &base {
                    Some(base) => Some(base.node_name.clone()),
                    None => selector::choose(state, &candidates, preferred, &[]),
                };
                let placement = PlacementContext {
                    base_snap_dfn_uuid: base.map(|b| b.source_uuid),
                    target_node,
                };
                Ok(Reported::new(placement, report))
            })
            .await
    }
}

/// Start keys of a delete selection, expanded through the graph.
fn plan_deletion(
    state: &ClusterState,
    listing: &RemoteListing,
    graph: &BackupGraph,
    selection: &DeleteSelection,
    flags: DeleteFlags,
) -> Result<DeletionPlan> {
    let mut cascade = flags.cascade;
    let mut plan = DeletionPlan::default();
    let manifests = || graph.manifests().filter_map(|n| Some((n, n.manifest.as_ref()?)));

    let start_keys: BTreeSet<String> = match selection {
        DeleteSelection::Id(id) => BTreeSet::from([key::manifest_key_for_id(id)]),
        DeleteSelection::Key(key) => BTreeSet::from([key.clone()]),
        DeleteSelection::IdPrefix(prefix) => {
            let matching: BTreeSet<String> = listing
                .keys
                .iter()
                .filter(|k| k.starts_with(prefix.as_str()) && key::parse_manifest_key(k).is_some())
                .cloned()
                .collect();
            if matching.len() > 1 {
                return Err(ShippingError::InvalidInput(format!(
                    "prefix '{prefix}' is ambiguous: {}",
                    matching.iter().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
            if matching.is_empty() {
                plan.not_found.insert(prefix.clone());
            }
            matching
        }
        DeleteSelection::Filter {
            older_than,
            rsc_name,
            node_name,
        } => {
            if older_than.is_none() && rsc_name.is_none() && node_name.is_none() {
                return Err(ShippingError::InvalidInput(
                    "a delete filter needs at least one criterion".to_string(),
                ));
            }
            let older_than = older_than
                .as_deref()
                .map(|ts| {
                    key::parse_timestamp(ts).ok_or_else(|| {
                        ShippingError::InvalidInput(format!("'{ts}' is not a YYYYMMDD_HHMMSS timestamp"))
                    })
                })
                .transpose()?;
            manifests()
                .filter(|(node, manifest)| {
                    let Some(backup_key) = key::parse_manifest_key(&node.key) else {
                        return false;
                    };
                    older_than.map_or(true, |limit| backup_key.timestamp < limit)
                        && rsc_name.as_deref().map_or(true, |r| backup_key.rsc_name == r)
                        && node_name.as_deref().map_or(true, |n| manifest.node_name == n)
                })
                .map(|(node, _)| node.key.clone())
                .collect()
        }
        DeleteSelection::All => {
            cascade = true;
            listing
                .keys
                .iter()
                .filter(|k| key::parse_key(k).is_some())
                .cloned()
                .collect()
        }
        DeleteSelection::AllLocalCluster => {
            cascade = true;
            manifests()
                .filter(|(_, manifest)| manifest.cluster_id == state.cluster_id)
                .map(|(node, _)| node.key.clone())
                .collect()
        }
    };

    for start in &start_keys {
        plan.merge(graph.collect_for_deletion(start, cascade)?);
    }
    Ok(plan)
}

/// Based-on chain of a manifest, checked for completeness.
fn chain_info(listing: &RemoteListing, manifest_key: &str) -> Result<BackupInfo> {
    let graph = BackupGraph::build(listing);
    let (chain, missing_manifest) = graph.based_on_chain(manifest_key);
    if chain.is_empty() {
        return Err(ShippingError::NotFound(format!("backup '{manifest_key}'")));
    }

    let mut missing: Vec<String> = missing_manifest.into_iter().collect();
    let mut total_size: u64 = 0;
    for node in &chain {
        for child in &node.references {
            let child = graph.get(*child);
            if !child.exists && key::parse_manifest_key(&child.key).is_none() {
                missing.push(child.key.clone());
            }
        }
        if let Some(manifest) = &node.manifest {
            total_size = total_size.saturating_add(manifest.known_size());
        }
    }

    let ids: Vec<String> = chain
        .iter()
        .rev()
        .map(|node| node.key.trim_end_matches(key::META_SUFFIX).to_string())
        .collect();
    Ok(BackupInfo {
        id: manifest_key.trim_end_matches(key::META_SUFFIX).to_string(),
        chain: ids,
        total_size,
        restorable: missing.is_empty(),
        missing,
    })
}
