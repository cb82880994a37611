//! Per-node shipment capacity.
//!
//! Nothing is counted incrementally. Active shipments are derived from snapshot flags every time,
//! so the numbers can never drift from the actual cluster state.

use crate::models::props::{self, Props};
use crate::models::{ClusterState, Node};

/// Limit value standing for "no limit configured".
pub const UNLIMITED: i64 = i64::MAX;

fn limit_from(props: &Props) -> Option<i64> {
    props.get_i64(
        props::KEY_MAX_CONCURRENT_BACKUPS_PER_NODE,
        props::NAMESPC_BACKUP_SHIPPING,
    )
}

/// Node property first, then the controller default. Absent or negative means unlimited.
pub fn effective_limit(state: &ClusterState, node: &Node) -> i64 {
    match limit_from(&node.props).or_else(|| limit_from(&state.ctrl_props)) {
        Some(limit) if limit >= 0 => limit,
        _ => UNLIMITED,
    }
}

/// Source-role shipments currently running on `node_name`.
pub fn active_shipments(state: &ClusterState, node_name: &str) -> i64 {
    state
        .snapshot_dfns()
        .filter(|snap_dfn| snap_dfn.is_shipping_backup())
        .filter_map(|snap_dfn| snap_dfn.snapshot_on(node_name))
        .filter(|snap| snap.flags.backup_source && !snap.flags.backup_target)
        .count() as i64
}

/// Remaining capacity. Zero or less means the node is full; unknown nodes have none.
pub fn free_slots(state: &ClusterState, node_name: &str) -> i64 {
    let Some(node) = state.nodes.get(node_name) else {
        return 0;
    };
    effective_limit(state, node).saturating_sub(active_shipments(state, node_name))
}
