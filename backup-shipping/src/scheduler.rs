//! Admission, queueing and promotion of shipments.
//!
//! Every function here runs synchronously on a [`ClusterState`] inside a write scope, so decisions
//! for one node are totally ordered. Side effects on the network are not performed here; callers
//! get a [`SchedulerOutcome`] naming the nodes to notify.

use chrono::NaiveDateTime;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::admission;
use crate::chain::{self, BaseSource};
use crate::graph::BackupGraph;
use crate::key::{self, BackupKey};
use crate::models::props;
use crate::models::{
    ClusterState, PlacementContext, RemoteKind, ShipmentKey, ShipmentRequest, Snapshot, SnapshotDefinition,
};
use crate::node_finder::{self, CandidateQuery};
use crate::queue::QueueItem;
use crate::selector;
use crate::utils::errors::{Result, ShippingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub key: ShipmentKey,
    pub node: String,
    pub prev_snap: Option<String>,
}

/// Everything a scheduler call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerOutcome {
    pub started: Vec<Started>,
    pub queued: Vec<ShipmentKey>,
    pub aborted: Vec<ShipmentKey>,
    /// Shipments that could not be re-admitted, with the reason
    pub dropped: Vec<(ShipmentKey, String)>,
    /// Nodes whose satellites must learn about changed snapshots
    pub notify: BTreeSet<String>,
}

impl SchedulerOutcome {
    pub fn merge(&mut self, other: SchedulerOutcome) {
        self.started.extend(other.started);
        self.queued.extend(other.queued);
        self.aborted.extend(other.aborted);
        self.dropped.extend(other.dropped);
        self.notify.extend(other.notify);
    }

    pub fn started_on(&self, key: &ShipmentKey) -> Option<&str> {
        self.started
            .iter()
            .find(|s| &s.key == key)
            .map(|s| s.node.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub key: ShipmentKey,
    pub backup_key: BackupKey,
    pub prev_snap: Option<String>,
    pub node: Option<String>,
    /// Parked until the destination cluster decided placement
    pub awaiting_placement: bool,
    pub outcome: SchedulerOutcome,
}

fn shipping_tools(kind: RemoteKind) -> Vec<&'static str> {
    kind.required_tools()
        .iter()
        .chain(kind.optional_tools())
        .copied()
        .collect()
}

fn is_shipped(state: &ClusterState, rsc_name: &str, snap_name: &str) -> bool {
    state
        .snap_dfn(rsc_name, snap_name)
        .is_some_and(|s| s.flags.shipped)
}

/// The chain must not overtake an unfinished base.
fn must_wait(state: &ClusterState, rsc_name: &str, prev_snap: Option<&str>) -> bool {
    prev_snap.is_some_and(|prev| state.snap_dfn(rsc_name, prev).is_some() && !is_shipped(state, rsc_name, prev))
}

fn candidates_for(state: &ClusterState, item: &QueueItem) -> Result<BTreeSet<String>> {
    let remote = state.remote(&item.request.remote_name)?;
    node_finder::find_candidates(
        state,
        &CandidateQuery {
            rsc_name: &item.request.rsc_name,
            snap_name: Some(&item.request.snap_name),
            base_snap_name: item.prev_snap.as_deref(),
            remote_name: &item.request.remote_name,
            remote_kind: remote.kind(),
        },
    )
}

/// Records a new backup snapshot and admits or queues its shipment.
pub fn submit(
    state: &mut ClusterState,
    request: ShipmentRequest,
    graph: Option<&BackupGraph>,
    now: NaiveDateTime,
) -> Result<Submitted> {
    let remote = state.remote(&request.remote_name)?;
    let kind = remote.kind();
    if !kind.accepts_shipments() {
        return Err(ShippingError::InvalidRemote(format!(
            "cannot ship backups to remote '{}'",
            request.remote_name
        )));
    }
    if remote.is_marked_for_deletion() {
        return Err(ShippingError::InvalidRemote(format!(
            "remote '{}' is being deleted",
            request.remote_name
        )));
    }
    if state.restores.contains(&request.rsc_name) {
        return Err(ShippingError::Conflict(format!(
            "resource '{}' is being restored",
            request.rsc_name
        )));
    }
    let rsc_dfn = state.rsc_dfn(&request.rsc_name)?;
    if rsc_dfn.snapshot_dfns.contains_key(&request.snap_name) {
        return Err(ShippingError::Conflict(format!(
            "snapshot '{}' of resource '{}' already exists",
            request.snap_name, request.rsc_name
        )));
    }

    let prev_snap = chain::resolve_local_base(
        state,
        graph,
        &request.rsc_name,
        &request.remote_name,
        request.allow_incremental,
        BaseSource::LastStartedOrQueued,
    );
    let suffix = state
        .ctrl_props
        .get(props::KEY_SITE_SUFFIX, props::NAMESPC_BACKUP_SHIPPING)
        .map(String::from);
    let backup_key = BackupKey::manifest(&request.rsc_name, now, suffix.clone(), Some(request.snap_name.clone()));

    record_snapshot(state, &request, now, suffix.as_deref())?;

    let awaiting_placement = kind.needs_placement() && request.placement.is_none();
    let mut item = QueueItem {
        request,
        prev_snap,
        candidates: BTreeSet::new(),
        awaiting_placement,
    };
    // fails early if nobody could ever ship this resource
    let candidates = candidates_for(state, &item)?;
    if !awaiting_placement {
        item.candidates = candidates;
    }

    let key = item.key();
    let prev_snap = item.prev_snap.clone();
    let mut outcome = SchedulerOutcome::default();
    let force_queue = awaiting_placement || must_wait(state, &key.rsc_name, prev_snap.as_deref());
    let node = admit_or_queue(state, item, force_queue, &mut outcome)?;

    info!(
        resource = %key.rsc_name,
        snapshot = %key.snap_name,
        remote = %key.remote_name,
        base = ?prev_snap,
        node = ?node,
        "Backup shipment submitted"
    );
    Ok(Submitted {
        key,
        backup_key,
        prev_snap,
        node,
        awaiting_placement,
        outcome,
    })
}

/// Snapshot definition plus one instance per diskful node, flagged as backup.
fn record_snapshot(
    state: &mut ClusterState,
    request: &ShipmentRequest,
    now: NaiveDateTime,
    suffix: Option<&str>,
) -> Result<()> {
    let rsc_dfn = state.rsc_dfn_mut(&request.rsc_name)?;
    let mut snap_dfn = SnapshotDefinition::new(&request.rsc_name, &request.snap_name);
    snap_dfn.flags.backup = true;
    snap_dfn.volume_sizes = rsc_dfn.volume_sizes();
    snap_dfn.props.set(
        props::KEY_START_TIMESTAMP,
        props::NAMESPC_BACKUP_SHIPPING,
        now.format(key::TIMESTAMP_FORMAT).to_string(),
    );
    if let Some(suffix) = suffix {
        snap_dfn
            .props
            .set(props::KEY_SITE_SUFFIX, props::NAMESPC_BACKUP_SHIPPING, suffix);
    }
    if let Some(schedule) = &request.schedule {
        snap_dfn
            .props
            .set(props::KEY_SCHEDULE, props::NAMESPC_BACKUP_SHIPPING, schedule.clone());
    }
    let nodes: Vec<String> = rsc_dfn.diskful_nodes().map(String::from).collect();
    for node in nodes {
        snap_dfn.snapshots.insert(node.clone(), Snapshot::new(node));
    }
    rsc_dfn.snapshot_dfns.insert(request.snap_name.clone(), snap_dfn);
    rsc_dfn.props.set(
        props::KEY_LAST_STARTED_OR_QUEUED,
        &props::remote_namespace(&request.remote_name),
        request.snap_name.clone(),
    );
    Ok(())
}

/// Starts the item on a chosen node, or queues it. Returns the node it started on.
pub fn admit_or_queue(
    state: &mut ClusterState,
    item: QueueItem,
    force_queue: bool,
    outcome: &mut SchedulerOutcome,
) -> Result<Option<String>> {
    if !force_queue {
        let kind = state.remote(&item.request.remote_name)?.kind();
        let chosen = selector::choose(
            state,
            &item.candidates,
            item.request.preferred_node.as_deref(),
            &shipping_tools(kind),
        );
        if let Some(node) = chosen {
            start_shipping(state, item, &node, outcome)?;
            return Ok(Some(node));
        }
    }

    let key = item.key();
    debug!(shipment = %key, candidates = ?item.candidates, force_queue, "Queueing shipment");
    state.queues.enqueue(item)?;
    outcome.queued.push(key);
    Ok(None)
}

/// Marks the shipment as running on `node` and hands over undecided items waiting for it.
fn start_shipping(
    state: &mut ClusterState,
    item: QueueItem,
    node: &str,
    outcome: &mut SchedulerOutcome,
) -> Result<()> {
    let key = item.key();
    state.queues.take(&key);

    let snap_dfn = state.snap_dfn_mut(&key.rsc_name, &key.snap_name)?;
    snap_dfn.flags.shipping = true;
    snap_dfn.flags.backup = true;
    snap_dfn.props.set(
        props::KEY_SOURCE_NODE,
        &props::remote_namespace(&key.remote_name),
        node,
    );
    let snap = snap_dfn.snapshots.get_mut(node).ok_or_else(|| {
        ShippingError::Internal(format!("shipment {key} chose node '{node}' without a snapshot"))
    })?;
    snap.flags.backup_source = true;
    snap.props
        .set(props::KEY_TARGET_REMOTE, props::NAMESPC_BACKUP_SHIPPING, key.remote_name.clone());
    match &item.prev_snap {
        Some(prev) => {
            snap.props
                .set(props::KEY_LAST_SNAPSHOT, props::NAMESPC_BACKUP_SHIPPING, prev.clone());
        }
        None => {
            snap.props
                .remove(props::KEY_LAST_SNAPSHOT, props::NAMESPC_BACKUP_SHIPPING);
        }
    }

    info!(shipment = %key, node = %node, base = ?item.prev_snap, "Starting shipment");
    outcome.notify.insert(node.to_string());
    outcome.started.push(Started {
        key: key.clone(),
        node: node.to_string(),
        prev_snap: item.prev_snap,
    });

    // items waiting for this snapshot now know where their base lives
    let waiting = state
        .queues
        .take_undecided_for_prev(&key.remote_name, &key.rsc_name, &key.snap_name);
    for mut waiter in waiting {
        match candidates_for(state, &waiter) {
            Ok(candidates) => {
                waiter.candidates = candidates;
                admit_or_queue(state, waiter, true, outcome)?;
            }
            Err(err) => {
                warn!(shipment = %waiter.key(), error = %err, "Dropping queued shipment");
                outcome.dropped.push((waiter.key(), err.to_string()));
            }
        }
    }
    Ok(())
}

/// Whether a queued item may start: its base is gone or already shipped.
fn is_ready(state: &ClusterState, item: &QueueItem) -> bool {
    match &item.prev_snap {
        None => true,
        Some(prev) => match state.snap_dfn(&item.request.rsc_name, prev) {
            None => true,
            Some(snap_dfn) => snap_dfn.is_deleted() || snap_dfn.flags.shipped,
        },
    }
}

/// Fills free slots of `node` from its queue, in FIFO order.
pub fn on_capacity_freed(state: &mut ClusterState, node: &str) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    let mut attempts = state.queues.node_queue(node).len();

    while attempts > 0 && admission::free_slots(state, node) > 0 {
        attempts -= 1;
        let next = state
            .queues
            .node_queue(node)
            .into_iter()
            .find(|k| state.queues.get(k).is_some_and(|item| is_ready(state, item)));
        let Some(key) = next else {
            break;
        };
        let Some(item) = state.queues.take(&key) else {
            break;
        };
        promote(state, item, node, &mut outcome)?;
    }
    Ok(outcome)
}

/// Starts a dequeued item on `node`, re-resolving its base first if the base became unusable.
fn promote(state: &mut ClusterState, mut item: QueueItem, node: &str, outcome: &mut SchedulerOutcome) -> Result<()> {
    let base_usable = match &item.prev_snap {
        None => true,
        Some(prev) => state
            .snap_dfn(&item.request.rsc_name, prev)
            .is_some_and(|s| !s.is_deleted() && s.flags.shipped && s.snapshot_on(node).is_some()),
    };
    if base_usable && item.candidates.contains(node) {
        return start_shipping(state, item, node, outcome);
    }

    let key = item.key();
    let new_prev = chain::resolve_local_base(
        state,
        None,
        &key.rsc_name,
        &key.remote_name,
        item.request.allow_incremental,
        BaseSource::LastShipped,
    )
    .filter(|prev| prev != &key.snap_name);
    if new_prev != item.prev_snap {
        warn!(shipment = %key, old = ?item.prev_snap, new = ?new_prev, "Base of queued shipment changed");
    }
    item.prev_snap = new_prev;

    match candidates_for(state, &item) {
        Ok(candidates) => {
            item.candidates = candidates;
            let force_queue = must_wait(state, &key.rsc_name, item.prev_snap.as_deref());
            if !force_queue && item.candidates.contains(node) {
                start_shipping(state, item, node, outcome)
            } else {
                admit_or_queue(state, item, force_queue, outcome).map(|_| ())
            }
        }
        Err(err) => {
            warn!(shipment = %key, error = %err, "Dropping queued shipment");
            outcome.dropped.push((key, err.to_string()));
            Ok(())
        }
    }
}

/// Re-admits items that lost their queue, dropping those nobody can ship anymore.
fn readmit(state: &mut ClusterState, items: Vec<QueueItem>, outcome: &mut SchedulerOutcome) -> Result<()> {
    for mut item in items {
        let key = item.key();
        if item.awaiting_placement {
            state.queues.enqueue(item)?;
            outcome.queued.push(key);
            continue;
        }
        match candidates_for(state, &item) {
            Ok(candidates) => {
                item.candidates = candidates;
                let force_queue = must_wait(state, &key.rsc_name, item.prev_snap.as_deref());
                admit_or_queue(state, item, force_queue, outcome)?;
            }
            Err(err) => {
                warn!(shipment = %key, error = %err, "Dropping queued shipment");
                outcome.dropped.push((key, err.to_string()));
            }
        }
    }
    Ok(())
}

/// Completion of a shipment reported by its source node.
pub fn shipping_finished(
    state: &mut ClusterState,
    rsc_name: &str,
    snap_name: &str,
    node: &str,
    success: bool,
) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    let snap_dfn = state.snap_dfn_mut(rsc_name, snap_name)?;
    if !snap_dfn.flags.shipping {
        return Err(ShippingError::InvalidInput(format!(
            "snapshot '{snap_name}' of resource '{rsc_name}' is not shipping"
        )));
    }
    let aborted = snap_dfn.flags.shipping_abort;
    let snap = snap_dfn.snapshots.get_mut(node).ok_or_else(|| {
        ShippingError::NotFound(format!("snapshot '{snap_name}' of resource '{rsc_name}' on node '{node}'"))
    })?;
    let remote_name = snap.target_remote().map(String::from).ok_or_else(|| {
        ShippingError::Internal(format!("snapshot '{snap_name}' on node '{node}' has no target remote"))
    })?;
    snap.flags.backup_source = false;

    snap_dfn.flags.shipping = false;
    outcome.notify.insert(node.to_string());
    let key = ShipmentKey::new(rsc_name, snap_name, &remote_name);

    if aborted {
        snap_dfn.flags.delete = true;
        info!(shipment = %key, "Shipment aborted");
        outcome.aborted.push(key);
        let released = state.queues.drop_prev_snapshot(rsc_name, snap_name);
        readmit(state, released, &mut outcome)?;
    } else if success {
        snap_dfn.flags.shipped = true;
        state.rsc_dfn_mut(rsc_name)?.props.set(
            props::KEY_LAST_SHIPPED,
            &props::remote_namespace(&remote_name),
            snap_name,
        );
        info!(shipment = %key, node = %node, "Shipment finished");

        for follow_up in state.queues.follow_ups(rsc_name, snap_name) {
            if let Some(item) = state.queues.take(&follow_up) {
                readmit(state, vec![item], &mut outcome)?;
            }
        }
    } else {
        warn!(shipment = %key, node = %node, "Shipment failed");
        let released = state.queues.drop_prev_snapshot(rsc_name, snap_name);
        readmit(state, released, &mut outcome)?;
    }

    outcome.merge(on_capacity_freed(state, node)?);
    Ok(outcome)
}

/// The destination of a cross-cluster shipment decided where to receive and which base to use.
pub fn on_placement_decided(
    state: &mut ClusterState,
    key: &ShipmentKey,
    placement: PlacementContext,
) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    let Some(mut item) = state.queues.take(key) else {
        return Err(ShippingError::NotFound(format!("queued shipment {key}")));
    };

    item.prev_snap = placement.base_snap_dfn_uuid.and_then(|uuid| {
        state
            .rsc_dfn(&key.rsc_name)
            .ok()?
            .snapshot_dfns
            .values()
            .find(|s| s.uuid == uuid && !s.is_deleted())
            .map(|s| s.name.clone())
    });
    if placement.base_snap_dfn_uuid.is_some() && item.prev_snap.is_none() {
        warn!(shipment = %key, "Base chosen by destination is gone, shipping a full backup");
    }
    item.awaiting_placement = false;
    item.request.placement = Some(placement);

    item.candidates = candidates_for(state, &item)?;
    let force_queue = must_wait(state, &key.rsc_name, item.prev_snap.as_deref());
    admit_or_queue(state, item, force_queue, &mut outcome)?;
    Ok(outcome)
}

/// Re-queues everything that was waiting on `node` and forgets the node.
///
/// Shipments running on `node` fail. Queued shipments based on a failed shipment, or on a snapshot
/// that only existed on `node`, become full backups.
pub fn on_node_removed(state: &mut ClusterState, node: &str) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    state.node(node)?;
    let orphans = state.queues.remove_node(node);
    state.nodes.remove(node);

    let mut unusable_bases = Vec::new();
    let mut failed = Vec::new();
    for rsc_dfn in state.rsc_dfns.values_mut() {
        rsc_dfn.resources.remove(node);
        for snap_dfn in rsc_dfn.snapshot_dfns.values_mut() {
            let Some(snap) = snap_dfn.snapshots.remove(node) else {
                continue;
            };
            if snap_dfn.flags.shipping && snap.flags.backup_source {
                snap_dfn.flags.shipping = false;
                failed.push(ShipmentKey::new(
                    &rsc_dfn.name,
                    &snap_dfn.name,
                    snap.target_remote().unwrap_or_default(),
                ));
                unusable_bases.push((rsc_dfn.name.clone(), snap_dfn.name.clone()));
            } else if snap_dfn.snapshots.is_empty() {
                unusable_bases.push((rsc_dfn.name.clone(), snap_dfn.name.clone()));
            }
        }
    }
    for key in failed {
        warn!(shipment = %key, node = %node, "Shipment lost with its node");
        outcome.dropped.push((key, format!("node '{node}' was removed")));
    }

    let mut items = Vec::new();
    for mut item in orphans {
        item.candidates.remove(node);
        if let Some(prev) = &item.prev_snap {
            if unusable_bases.iter().any(|(r, s)| r == &item.request.rsc_name && s == prev) {
                warn!(shipment = %item.key(), base = %prev, "Base was lost with the removed node, shipping a full backup");
                item.prev_snap = None;
            }
        }
        items.push(item);
    }
    for (rsc_name, snap_name) in &unusable_bases {
        items.extend(state.queues.drop_prev_snapshot(rsc_name, snap_name));
    }
    readmit(state, items, &mut outcome)?;

    // items left in other node queues may have lost their base and be ready now
    let nodes: Vec<String> = state.nodes.keys().cloned().collect();
    for name in nodes {
        outcome.merge(on_capacity_freed(state, &name)?);
    }
    Ok(outcome)
}

/// The shipment limit of one node, or of the whole cluster, changed.
pub fn max_concurrency_changed(state: &mut ClusterState, node: Option<&str>) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    let nodes: Vec<String> = match node {
        Some(name) => vec![state.node(name)?.name.clone()],
        None => state.nodes.keys().cloned().collect(),
    };

    for name in nodes {
        let limit = admission::effective_limit(state, state.node(&name)?);
        if limit == 0 {
            let items = state.queues.remove_node(&name);
            debug!(node = %name, count = items.len(), "Shipping disabled, moving queued shipments");
            readmit(state, items, &mut outcome)?;
        } else {
            outcome.merge(on_capacity_freed(state, &name)?);
        }
    }
    Ok(outcome)
}

/// Cancels one queued shipment before it ever started.
pub fn cancel_queued(state: &mut ClusterState, key: &ShipmentKey) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    if state.queues.take(key).is_none() {
        return Ok(outcome);
    }
    if let Ok(snap_dfn) = state.snap_dfn_mut(&key.rsc_name, &key.snap_name) {
        snap_dfn.flags.shipping_abort = true;
        snap_dfn.flags.delete = true;
    }
    let released = state.queues.drop_prev_snapshot(&key.rsc_name, &key.snap_name);
    readmit(state, released, &mut outcome)?;
    info!(shipment = %key, "Queued shipment aborted");
    outcome.aborted.push(key.clone());
    Ok(outcome)
}

/// Cancels queued and running shipments of a resource.
pub fn abort(state: &mut ClusterState, rsc_name: &str, remote: Option<&str>) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    state.rsc_dfn(rsc_name)?;

    for key in state.queues.keys_for_resource(rsc_name, remote) {
        outcome.merge(cancel_queued(state, &key)?);
    }

    let rsc_dfn = state.rsc_dfn_mut(rsc_name)?;
    for snap_dfn in rsc_dfn.snapshot_dfns.values_mut() {
        if !snap_dfn.is_shipping_backup() || snap_dfn.flags.shipping_abort {
            continue;
        }
        let Some(source) = snap_dfn.snapshots.values().find(|s| s.flags.backup_source) else {
            continue;
        };
        let target = source.target_remote().unwrap_or_default().to_string();
        if remote.is_some_and(|r| r != target) {
            continue;
        }
        snap_dfn.flags.shipping_abort = true;
        outcome.notify.insert(source.node_name.clone());
        let key = ShipmentKey::new(rsc_name, &snap_dfn.name, target);
        info!(shipment = %key, "Aborting running shipment");
        outcome.aborted.push(key);
    }
    Ok(outcome)
}

/// Blocks new shipments to `remote` and cancels every queued or running one.
pub fn remote_marked_for_deletion(state: &mut ClusterState, remote: &str) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    state
        .remotes
        .get_mut(remote)
        .ok_or_else(|| ShippingError::NotFound(format!("remote '{remote}'")))?
        .mark_for_deletion();

    for item in state.queues.remove_remote(remote) {
        let key = item.key();
        if let Ok(snap_dfn) = state.snap_dfn_mut(&key.rsc_name, &key.snap_name) {
            snap_dfn.flags.shipping_abort = true;
            snap_dfn.flags.delete = true;
        }
        outcome.aborted.push(key);
    }

    let shipping: Vec<String> = state
        .rsc_dfns
        .values()
        .filter(|r| {
            r.snapshot_dfns
                .values()
                .any(|s| s.is_shipping_backup() && s.target_remote() == Some(remote))
        })
        .map(|r| r.name.clone())
        .collect();
    for rsc_name in shipping {
        outcome.merge(abort(state, &rsc_name, Some(remote))?);
    }
    info!(remote = %remote, aborted = outcome.aborted.len(), "Remote marked for deletion");
    Ok(outcome)
}

/// Marks a local snapshot for deletion. Queued shipments based on it become full backups.
pub fn delete_snapshot(state: &mut ClusterState, rsc_name: &str, snap_name: &str) -> Result<SchedulerOutcome> {
    let mut outcome = SchedulerOutcome::default();
    let snap_dfn = state.snap_dfn_mut(rsc_name, snap_name)?;
    if snap_dfn.is_shipping_backup() {
        return Err(ShippingError::Conflict(format!(
            "snapshot '{snap_name}' of resource '{rsc_name}' is still shipping"
        )));
    }
    snap_dfn.flags.delete = true;
    outcome.notify.extend(snap_dfn.snapshots.keys().cloned());

    let released = state.queues.drop_prev_snapshot(rsc_name, snap_name);
    readmit(state, released, &mut outcome)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShipmentState;
    use crate::test_support;

    fn now(day: u32) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn request(rsc: &str, snap: &str, remote: &str) -> ShipmentRequest {
        ShipmentRequest::new(rsc, snap, remote)
    }

    fn assert_within_limits(state: &ClusterState) {
        for node in state.nodes.values() {
            assert!(admission::active_shipments(state, &node.name) <= admission::effective_limit(state, node));
        }
    }

    fn assert_single_membership(state: &ClusterState, keys: &[ShipmentKey]) {
        for key in keys {
            assert!(state.queues.membership(key) <= 1);
        }
    }

    #[test]
    fn test_submit_starts_immediately() {
        let mut state = test_support::cluster(&[("n1", Some(1))]);
        test_support::add_resource(&mut state, "rsc", &["n1"], &[(0, 1024)]);

        let submitted = submit(&mut state, request("rsc", "back_20240101_000000", "s3"), None, now(1)).unwrap();
        assert_eq!(submitted.node.as_deref(), Some("n1"));
        assert!(submitted.prev_snap.is_none());
        assert_eq!(submitted.backup_key.to_string(), "rsc_back_20240101_000000.meta");

        let snap_dfn = state.snap_dfn("rsc", "back_20240101_000000").unwrap();
        assert_eq!(ShipmentState::derive(snap_dfn, false), ShipmentState::Shipping);
        assert_eq!(snap_dfn.source_node("s3"), Some("n1"));
        assert_eq!(snap_dfn.target_remote(), Some("s3"));
        assert_eq!(
            state.rsc_dfn("rsc").unwrap().last_started_or_queued("s3"),
            Some("back_20240101_000000")
        );
        assert_within_limits(&state);
    }

    #[test]
    fn test_queued_until_capacity_freed() {
        let mut state = test_support::cluster(&[("n1", Some(1))]);
        test_support::add_resource(&mut state, "rsc", &["n1"], &[(0, 1024)]);
        test_support::add_resource(&mut state, "other", &["n1"], &[(0, 1024)]);

        submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap();
        let mut second = request("other", "snap2", "s3");
        second.preferred_node = Some("n1".to_string());
        let submitted = submit(&mut state, second, None, now(1)).unwrap();
        assert!(submitted.node.is_none());
        assert!(state.queues.is_queued(&submitted.key));
        assert_within_limits(&state);

        let outcome = shipping_finished(&mut state, "rsc", "snap1", "n1", true).unwrap();
        assert_eq!(outcome.started_on(&submitted.key), Some("n1"));
        assert!(!state.queues.is_queued(&submitted.key));
        assert_eq!(state.rsc_dfn("rsc").unwrap().last_shipped("s3"), Some("snap1"));
        assert!(state.snap_dfn("rsc", "snap1").unwrap().flags.shipped);
        assert_within_limits(&state);
    }

    #[test]
    fn test_chain_waits_for_unshipped_base() {
        let mut state = test_support::cluster(&[("n1", None), ("n2", None)]);
        test_support::add_resource(&mut state, "rsc", &["n1", "n2"], &[(0, 1024)]);

        let first = submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap();
        let first_node = first.node.clone().unwrap();
        let second = submit(&mut state, request("rsc", "snap2", "s3"), None, now(2)).unwrap();

        assert_eq!(second.prev_snap.as_deref(), Some("snap1"));
        assert!(second.node.is_none());
        assert!(state.queues.is_queued(&second.key));
        assert_single_membership(&state, &[second.key.clone()]);

        let outcome = shipping_finished(&mut state, "rsc", "snap1", &first_node, true).unwrap();
        assert!(outcome.started_on(&second.key).is_some());
        let snap = state
            .snap_dfn("rsc", "snap2")
            .unwrap()
            .snapshots
            .values()
            .find(|s| s.flags.backup_source)
            .unwrap();
        assert_eq!(
            snap.props.get(props::KEY_LAST_SNAPSHOT, props::NAMESPC_BACKUP_SHIPPING),
            Some("snap1")
        );
    }

    #[test]
    fn test_undecided_item_handed_over_on_start() {
        let mut state = test_support::cluster(&[("n1", Some(0)), ("n2", Some(0))]);
        test_support::add_resource(&mut state, "rsc", &["n1", "n2"], &[(0, 1024)]);
        state.nodes.get_mut("n1").unwrap().props.set(
            props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
            props::NAMESPC_BACKUP_SHIPPING,
            "1",
        );
        test_support::add_resource(&mut state, "busy", &["n1"], &[(0, 1024)]);
        submit(&mut state, request("busy", "b1", "s3"), None, now(1)).unwrap();

        let first = submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap();
        assert!(first.node.is_none());
        let second = submit(&mut state, request("rsc", "snap2", "s3"), None, now(2)).unwrap();
        assert_eq!(state.queues.undecided_queue("s3"), vec![second.key.clone()]);

        let outcome = shipping_finished(&mut state, "busy", "b1", "n1", true).unwrap();
        assert_eq!(outcome.started_on(&first.key), Some("n1"));
        assert!(state.queues.undecided_queue("s3").is_empty());
        assert_eq!(state.queues.node_queue("n1"), vec![second.key.clone()]);
        assert_single_membership(&state, &[first.key, second.key]);
        assert_within_limits(&state);
    }

    #[test]
    fn test_promotion_revalidates_deleted_base() {
        let mut state = test_support::cluster(&[("n1", Some(1))]);
        test_support::add_resource(&mut state, "rsc", &["n1"], &[(0, 1024)]);
        test_support::add_resource(&mut state, "busy", &["n1"], &[(0, 1024)]);

        let old = submit(&mut state, request("rsc", "snap0", "s3"), None, now(1)).unwrap();
        shipping_finished(&mut state, "rsc", "snap0", "n1", true).unwrap();
        assert!(old.node.is_some());

        submit(&mut state, request("busy", "b1", "s3"), None, now(1)).unwrap();
        let first = submit(&mut state, request("rsc", "snap1", "s3"), None, now(2)).unwrap();
        assert_eq!(first.prev_snap.as_deref(), Some("snap0"));
        assert!(first.node.is_none());

        // base deleted while queued: LastShipped still names it, so the item falls back to full
        state.snap_dfn_mut("rsc", "snap0").unwrap().flags.delete = true;
        let outcome = shipping_finished(&mut state, "busy", "b1", "n1", true).unwrap();
        let started = outcome.started.iter().find(|s| s.key == first.key).unwrap();
        assert!(started.prev_snap.is_none());
    }

    #[test]
    fn test_failed_shipment_releases_followups_as_full() {
        let mut state = test_support::cluster(&[("n1", None)]);
        test_support::add_resource(&mut state, "rsc", &["n1"], &[(0, 1024)]);

        submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap();
        let second = submit(&mut state, request("rsc", "snap2", "s3"), None, now(2)).unwrap();
        assert!(second.node.is_none());

        let outcome = shipping_finished(&mut state, "rsc", "snap1", "n1", false).unwrap();
        let started = outcome.started.iter().find(|s| s.key == second.key).unwrap();
        assert!(started.prev_snap.is_none());
        assert!(!state.snap_dfn("rsc", "snap1").unwrap().flags.shipped);
        assert_eq!(state.rsc_dfn("rsc").unwrap().last_shipped("s3"), None);
    }

    #[test]
    fn test_node_removed_requeues_and_drops_base() {
        let mut state = test_support::cluster(&[("n1", Some(1)), ("n2", Some(1))]);
        test_support::add_resource(&mut state, "rsc", &["n1", "n2"], &[(0, 1024)]);
        test_support::add_snapshot(&mut state, "rsc", "base", &["n1"]);
        test_support::mark_shipping(&mut state, "rsc", "base", "n1", "s3");
        test_support::add_resource(&mut state, "busy", &["n2"], &[(0, 1024)]);
        submit(&mut state, request("busy", "b1", "s3"), None, now(1)).unwrap();

        let item = QueueItem {
            request: request("rsc", "snap2", "s3"),
            prev_snap: Some("base".to_string()),
            candidates: BTreeSet::from(["n1".to_string()]),
            awaiting_placement: false,
        };
        test_support::add_snapshot(&mut state, "rsc", "snap2", &["n1", "n2"]);
        let key = item.key();
        state.queues.enqueue(item).unwrap();

        let outcome = on_node_removed(&mut state, "n1").unwrap();
        assert!(!state.nodes.contains_key("n1"));
        assert!(outcome.dropped.iter().any(|(k, _)| k.snap_name == "base"));
        assert!(outcome.queued.contains(&key));
        let item = state.queues.get(&key).unwrap();
        assert!(item.prev_snap.is_none());
        assert_eq!(item.candidates, BTreeSet::from(["n2".to_string()]));

        let outcome = shipping_finished(&mut state, "busy", "b1", "n2", true).unwrap();
        assert_eq!(outcome.started_on(&key), Some("n2"));
    }

    #[test]
    fn test_node_removed_releases_followups_of_lost_shipment() {
        let mut state = test_support::cluster(&[("n1", None), ("n2", None)]);
        test_support::add_resource(&mut state, "rsc", &["n1", "n2"], &[(0, 1024)]);
        let first = submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap();
        assert_eq!(first.node.as_deref(), Some("n1"));
        let second = submit(&mut state, request("rsc", "snap2", "s3"), None, now(2)).unwrap();
        assert_eq!(second.prev_snap.as_deref(), Some("snap1"));
        assert!(state.queues.is_queued(&second.key));

        let outcome = on_node_removed(&mut state, "n1").unwrap();
        assert!(outcome.dropped.iter().any(|(k, _)| k == &first.key));
        let started = outcome.started.iter().find(|s| s.key == second.key).unwrap();
        assert_eq!(started.node, "n2");
        assert!(started.prev_snap.is_none());
        assert!(state.queues.is_empty());

        let snap1 = state.snap_dfn("rsc", "snap1").unwrap();
        assert!(!snap1.flags.shipping);
        assert!(!snap1.flags.shipped);
        assert_within_limits(&state);
    }

    #[test]
    fn test_limit_zero_moves_queue() {
        let mut state = test_support::cluster(&[("n1", Some(1)), ("n2", Some(1))]);
        test_support::add_resource(&mut state, "rsc", &["n1", "n2"], &[(0, 1024)]);
        test_support::add_resource(&mut state, "busy", &["n1", "n2"], &[(0, 1024)]);
        let first = submit(&mut state, request("busy", "b1", "s3"), None, now(1)).unwrap();
        let mut full = request("busy", "b2", "s3");
        full.allow_incremental = false;
        let second = submit(&mut state, full, None, now(2)).unwrap();
        assert_eq!(first.node.as_deref(), Some("n1"));
        assert_eq!(second.node.as_deref(), Some("n2"));
        let queued = submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap();
        assert!(queued.node.is_none());

        state.nodes.get_mut("n1").unwrap().props.set(
            props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
            props::NAMESPC_BACKUP_SHIPPING,
            "0",
        );
        let outcome = max_concurrency_changed(&mut state, Some("n1")).unwrap();
        assert!(outcome.queued.contains(&queued.key));
        assert_eq!(
            state.queues.get(&queued.key).unwrap().candidates,
            BTreeSet::from(["n2".to_string()])
        );
        assert!(state.queues.node_queue("n1").is_empty());
    }

    #[test]
    fn test_limit_raised_fills_slots() {
        let mut state = test_support::cluster(&[("n1", Some(1))]);
        test_support::add_resource(&mut state, "a", &["n1"], &[(0, 1024)]);
        test_support::add_resource(&mut state, "b", &["n1"], &[(0, 1024)]);
        submit(&mut state, request("a", "s1", "s3"), None, now(1)).unwrap();
        let queued = submit(&mut state, request("b", "s1", "s3"), None, now(1)).unwrap();
        assert!(queued.node.is_none());

        state.nodes.get_mut("n1").unwrap().props.set(
            props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
            props::NAMESPC_BACKUP_SHIPPING,
            "2",
        );
        let outcome = max_concurrency_changed(&mut state, None).unwrap();
        assert_eq!(outcome.started_on(&queued.key), Some("n1"));
        assert_within_limits(&state);
    }

    #[test]
    fn test_peer_cluster_waits_for_placement() {
        let mut state = test_support::cluster(&[("n1", None), ("n2", None)]);
        for node in state.nodes.values_mut() {
            node.ext_tools.insert("socat".to_string());
        }
        test_support::add_resource(&mut state, "rsc", &["n1", "n2"], &[(0, 1024)]);

        let submitted = submit(&mut state, request("rsc", "snap1", "dr"), None, now(1)).unwrap();
        assert!(submitted.awaiting_placement);
        assert_eq!(state.queues.undecided_queue("dr"), vec![submitted.key.clone()]);

        let outcome = on_placement_decided(&mut state, &submitted.key, PlacementContext::default()).unwrap();
        assert!(outcome.started_on(&submitted.key).is_some());
        assert!(state.queues.is_empty());
    }

    #[test]
    fn test_abort_queued_and_running() {
        let mut state = test_support::cluster(&[("n1", Some(1))]);
        test_support::add_resource(&mut state, "rsc", &["n1"], &[(0, 1024)]);
        let running = submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap();
        let queued = submit(&mut state, request("rsc", "snap2", "s3"), None, now(2)).unwrap();

        let outcome = abort(&mut state, "rsc", Some("s3")).unwrap();
        assert!(outcome.aborted.contains(&running.key));
        assert!(outcome.aborted.contains(&queued.key));
        assert!(state.queues.is_empty());
        assert!(outcome.notify.contains("n1"));

        let snap_dfn = state.snap_dfn("rsc", "snap1").unwrap();
        assert_eq!(ShipmentState::derive(snap_dfn, false), ShipmentState::Aborting);

        let outcome = shipping_finished(&mut state, "rsc", "snap1", "n1", false).unwrap();
        assert!(outcome.aborted.contains(&running.key));
        assert!(state.snap_dfn("rsc", "snap1").unwrap().is_deleted());
        assert_eq!(admission::active_shipments(&state, "n1"), 0);
    }

    #[test]
    fn test_delete_snapshot_releases_undecided() {
        let mut state = test_support::cluster(&[("n1", Some(0))]);
        test_support::add_resource(&mut state, "rsc", &["n1"], &[(0, 1024)]);
        test_support::add_snapshot(&mut state, "rsc", "base", &["n1"]);
        test_support::add_snapshot(&mut state, "rsc", "snap2", &["n1"]);
        state.nodes.get_mut("n1").unwrap().props.set(
            props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
            props::NAMESPC_BACKUP_SHIPPING,
            "1",
        );
        let key = ShipmentKey::new("rsc", "snap2", "s3");
        state
            .queues
            .enqueue(QueueItem {
                request: request("rsc", "snap2", "s3"),
                prev_snap: Some("base".to_string()),
                candidates: BTreeSet::new(),
                awaiting_placement: false,
            })
            .unwrap();

        let outcome = delete_snapshot(&mut state, "rsc", "base").unwrap();
        assert!(state.snap_dfn("rsc", "base").unwrap().is_deleted());
        let started = outcome.started.iter().find(|s| s.key == key).unwrap();
        assert!(started.prev_snap.is_none());
        assert!(state.queues.is_empty());
    }

    #[test]
    fn test_remote_deletion_cancels_shipments() {
        let mut state = test_support::cluster(&[("n1", Some(1))]);
        test_support::add_resource(&mut state, "a", &["n1"], &[(0, 1024)]);
        test_support::add_resource(&mut state, "b", &["n1"], &[(0, 1024)]);
        let running = submit(&mut state, request("a", "snap1", "s3"), None, now(1)).unwrap();
        let queued = submit(&mut state, request("b", "snap1", "s3"), None, now(1)).unwrap();
        assert!(state.queues.is_queued(&queued.key));

        let outcome = remote_marked_for_deletion(&mut state, "s3").unwrap();
        assert_eq!(outcome.aborted.len(), 2);
        assert!(outcome.aborted.contains(&running.key));
        assert!(state.queues.is_empty());
        assert!(state.snap_dfn("a", "snap1").unwrap().flags.shipping_abort);
        assert!(state.snap_dfn("b", "snap1").unwrap().is_deleted());

        let err = submit(&mut state, request("a", "snap2", "s3"), None, now(2)).unwrap_err();
        assert!(matches!(err, ShippingError::InvalidRemote(_)));
    }

    #[test]
    fn test_submit_rejections() {
        let mut state = test_support::cluster(&[("n1", None)]);
        test_support::add_resource(&mut state, "rsc", &["n1"], &[(0, 1024)]);

        state.restores.insert("rsc".to_string());
        let err = submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap_err();
        assert!(err.is_conflict());
        state.restores.clear();

        let err = submit(&mut state, request("rsc", "snap1", "nope"), None, now(1)).unwrap_err();
        assert!(matches!(err, ShippingError::NotFound(_)));

        state.remotes.get_mut("s3").unwrap().mark_for_deletion();
        let err = submit(&mut state, request("rsc", "snap1", "s3"), None, now(1)).unwrap_err();
        assert!(matches!(err, ShippingError::InvalidRemote(_)));
    }
}
