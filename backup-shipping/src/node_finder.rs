//! Candidate nodes for a shipment.

use std::collections::BTreeSet;
use tracing::debug;

use crate::admission;
use crate::models::{ClusterState, RemoteKind};
use crate::utils::errors::{Result, ShippingError};

/// What a node has to hold to ship a resource.
#[derive(Debug, Clone, Copy)]
pub struct CandidateQuery<'a> {
    pub rsc_name: &'a str,
    /// Snapshot being shipped, if it already exists
    pub snap_name: Option<&'a str>,
    /// Incremental base, if any
    pub base_snap_name: Option<&'a str>,
    pub remote_name: &'a str,
    pub remote_kind: RemoteKind,
}

/// Nodes able to ship the resource.
///
/// Fails with [`ShippingError::NoUsableNode`] if no node qualifies at all. An empty set means the
/// base has not started shipping yet, so the placement is still undecided.
pub fn find_candidates(state: &ClusterState, query: &CandidateQuery<'_>) -> Result<BTreeSet<String>> {
    let rsc_dfn = state.rsc_dfn(query.rsc_name)?;
    let snap_dfn = query
        .snap_name
        .and_then(|snap| rsc_dfn.snapshot_dfns.get(snap));
    let base_dfn = query
        .base_snap_name
        .and_then(|snap| rsc_dfn.snapshot_dfns.get(snap));
    let required_tools = query.remote_kind.required_tools();

    let usable: BTreeSet<String> = rsc_dfn
        .diskful_nodes()
        .filter(|name| {
            let Some(node) = state.nodes.get(*name) else {
                return false;
            };
            node.is_usable()
                && admission::effective_limit(state, node) != 0
                && node.has_tools(required_tools)
                && snap_dfn.map_or(true, |s| s.snapshot_on(name).is_some())
                && base_dfn.map_or(true, |s| s.snapshot_on(name).is_some())
        })
        .map(String::from)
        .collect();

    if usable.is_empty() {
        return Err(ShippingError::NoUsableNode(format!(
            "no node can ship resource '{}' to remote '{}'",
            query.rsc_name, query.remote_name
        )));
    }

    let Some(base_dfn) = base_dfn else {
        return Ok(usable);
    };
    let Some(source_node) = base_dfn.source_node(query.remote_name) else {
        debug!(
            resource = %query.rsc_name,
            base = %base_dfn.name,
            "Base snapshot has not started shipping, placement undecided"
        );
        return Ok(BTreeSet::new());
    };

    if rsc_dfn.same_node_chain {
        if usable.contains(source_node) {
            Ok(BTreeSet::from([source_node.to_string()]))
        } else {
            Err(ShippingError::NoUsableNode(format!(
                "node '{}' shipped the base '{}' of resource '{}' but cannot ship anymore",
                source_node, base_dfn.name, query.rsc_name
            )))
        }
    } else {
        Ok(usable)
    }
}
