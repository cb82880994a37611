//! Picks the node that performs a shipment.

use std::collections::BTreeSet;
use tracing::debug;

use crate::admission;
use crate::models::ClusterState;

/// Chooses a candidate with free capacity.
///
/// An explicitly preferred candidate wins as long as it has a free slot. Otherwise nodes having
/// every tool in `tools` are preferred over those that do not, and within a group the node with
/// the most free slots wins. Ties go to the lexicographically smallest node name.
pub fn choose(
    state: &ClusterState,
    candidates: &BTreeSet<String>,
    preferred: Option<&str>,
    tools: &[&str],
) -> Option<String> {
    if let Some(preferred) = preferred {
        if candidates.contains(preferred) && admission::free_slots(state, preferred) > 0 {
            debug!(node = %preferred, "Using preferred node");
            return Some(preferred.to_string());
        }
    }

    let mut best_with_tools: Option<(&str, i64)> = None;
    let mut best_without_tools: Option<(&str, i64)> = None;
    for name in candidates {
        let free = admission::free_slots(state, name);
        if free <= 0 {
            continue;
        }
        let has_tools = state
            .nodes
            .get(name)
            .is_some_and(|node| node.has_tools(tools));
        let best = if has_tools {
            &mut best_with_tools
        } else {
            &mut best_without_tools
        };
        if best.map_or(true, |(_, best_free)| free > best_free) {
            *best = Some((name.as_str(), free));
        }
    }

    best_with_tools
        .or(best_without_tools)
        .map(|(name, _)| name.to_string())
}
