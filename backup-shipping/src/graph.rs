//! Dependency graph of remote backup objects.
//!
//! One vertex per observed key, stored in an arena and addressed by [`NodeId`]. A manifest vertex
//! references its data objects and its based-on manifest; every reference has a matching
//! `referenced_by` back edge. Vertices can be referenced without existing in the listing: those
//! are dangling references and are reported, never dropped.

use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::key;
use crate::manifest::BackupManifest;
use crate::models::ClusterState;
use crate::store::RemoteListing;
use crate::utils::errors::{Result, ShippingError};

pub type NodeId = usize;

/// Local snapshot definition a manifest was matched to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapRef {
    pub rsc_name: String,
    pub snap_name: String,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub key: String,
    pub exists: bool,
    pub manifest: Option<BackupManifest>,
    pub snap_dfn: Option<SnapRef>,
    pub references: BTreeSet<NodeId>,
    pub referenced_by: BTreeSet<NodeId>,
}

impl GraphNode {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            exists: false,
            manifest: None,
            snap_dfn: None,
            references: BTreeSet::new(),
            referenced_by: BTreeSet::new(),
        }
    }

    pub fn is_manifest(&self) -> bool {
        self.manifest.is_some()
    }

    /// Manifest by name, whether or not its body could be read.
    fn has_manifest_key(&self) -> bool {
        self.manifest.is_some() || key::parse_manifest_key(&self.key).is_some()
    }
}

/// What a deletion would remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionPlan {
    pub keys: BTreeSet<String>,
    pub not_found: BTreeSet<String>,
    /// Local snapshot definitions belonging to deleted manifests
    pub snap_dfns: BTreeSet<SnapRef>,
}

impl DeletionPlan {
    pub fn merge(&mut self, other: DeletionPlan) {
        self.keys.extend(other.keys);
        self.not_found.extend(other.not_found);
        self.snap_dfns.extend(other.snap_dfns);
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, NodeId>,
}

impl BackupGraph {
    /// Builds the graph from a fetched listing. Manifest keys whose body could not be read are
    /// skipped; they may still show up as references of other manifests.
    pub fn build(listing: &RemoteListing) -> Self {
        let mut graph = BackupGraph::default();

        for key in &listing.keys {
            if let Some(manifest) = listing.manifests.get(key) {
                let id = graph.get_or_create(key);
                graph.nodes[id].exists = true;

                for data_key in manifest.data_keys() {
                    let child = graph.get_or_create(data_key);
                    graph.link(id, child);
                }
                if let Some(base) = manifest.based_on.as_deref() {
                    let base_id = graph.get_or_create(base);
                    graph.link(id, base_id);
                }
                graph.nodes[id].manifest = Some(manifest.clone());
            }

            if key::parse_data_key(key).is_some() {
                let id = graph.get_or_create(key);
                graph.nodes[id].exists = true;
            }
        }

        debug!(vertices = graph.nodes.len(), "Built backup graph");
        graph
    }

    fn get_or_create(&mut self, key: &str) -> NodeId {
        if let Some(id) = self.index.get(key) {
            return *id;
        }
        let id = self.nodes.len();
        self.nodes.push(GraphNode::new(key));
        self.index.insert(key.to_string(), id);
        id
    }

    fn link(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].references.insert(to);
        self.nodes[to].referenced_by.insert(from);
    }

    /// Matches every manifest to a local snapshot definition with the same identity.
    /// Returns a warning per name clash with a different identity.
    pub fn associate_snapshots(&mut self, state: &ClusterState) -> Vec<String> {
        let mut warnings = Vec::new();
        for node in &mut self.nodes {
            let Some(manifest) = &node.manifest else {
                continue;
            };
            let Some(snap_dfn) = state.snap_dfn(&manifest.rsc_name, &manifest.snap_name) else {
                continue;
            };
            if manifest.snap_dfn_uuid == Some(snap_dfn.uuid) {
                node.snap_dfn = Some(SnapRef {
                    rsc_name: snap_dfn.rsc_name.clone(),
                    snap_name: snap_dfn.name.clone(),
                });
            } else {
                warn!(
                    key = %node.key,
                    snapshot = %snap_dfn.name,
                    "Local snapshot has the same name as the backup but a different identity"
                );
                warnings.push(format!(
                    "Snapshot '{}' of resource '{}' does not belong to backup '{}'",
                    snap_dfn.name, snap_dfn.rsc_name, node.key
                ));
            }
        }
        warnings
    }

    pub fn get(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    pub fn node(&self, key: &str) -> Option<&GraphNode> {
        self.index.get(key).map(|id| &self.nodes[*id])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn manifests(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().filter(|n| n.exists && n.is_manifest())
    }

    /// Keys that are referenced by a manifest but missing from the listing.
    pub fn dangling(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .filter(|n| !n.exists && !n.referenced_by.is_empty())
            .map(|n| n.key.as_str())
            .collect()
    }

    /// Existing manifest matched to the given local snapshot definition.
    pub fn manifest_for_snapshot(&self, rsc_name: &str, snap_name: &str) -> Option<&GraphNode> {
        self.manifests().find(|n| {
            n.snap_dfn
                .as_ref()
                .is_some_and(|s| s.rsc_name == rsc_name && s.snap_name == snap_name)
        })
    }

    /// Based-on chain starting at `manifest_key`, newest first. The second value is the first
    /// manifest of the chain that is missing, if any.
    pub fn based_on_chain(&self, manifest_key: &str) -> (Vec<&GraphNode>, Option<String>) {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = manifest_key.to_string();
        loop {
            let Some(node) = self.node(&current).filter(|n| n.exists && n.is_manifest()) else {
                return (chain, Some(current));
            };
            if !seen.insert(current.clone()) {
                return (chain, None);
            }
            chain.push(node);
            match node.manifest.as_ref().and_then(|m| m.based_on.clone()) {
                Some(base) => current = base,
                None => return (chain, None),
            }
        }
    }

    /// Collects everything that has to go when `start_key` is deleted.
    ///
    /// A manifest takes its data objects with it but never its based-on manifest. Manifests based
    /// on a deleted manifest are deleted too when `allow_cascade` is set; otherwise the first one
    /// found fails the whole request.
    pub fn collect_for_deletion(&self, start_key: &str, allow_cascade: bool) -> Result<DeletionPlan> {
        let mut plan = DeletionPlan::default();
        let Some(&start) = self.index.get(start_key) else {
            plan.not_found.insert(start_key.to_string());
            return Ok(plan);
        };
        let mut visited = BTreeSet::new();
        self.visit_for_deletion(start, allow_cascade, &mut plan, &mut visited)?;
        Ok(plan)
    }

    fn visit_for_deletion(
        &self,
        id: NodeId,
        allow_cascade: bool,
        plan: &mut DeletionPlan,
        visited: &mut BTreeSet<NodeId>,
    ) -> Result<()> {
        if !visited.insert(id) {
            return Ok(());
        }
        let node = &self.nodes[id];
        if !node.exists {
            plan.not_found.insert(node.key.clone());
            return Ok(());
        }
        plan.keys.insert(node.key.clone());
        if !node.is_manifest() {
            return Ok(());
        }
        if let Some(snap_ref) = &node.snap_dfn {
            plan.snap_dfns.insert(snap_ref.clone());
        }

        for child_id in &node.references {
            let child = &self.nodes[*child_id];
            if child.has_manifest_key() {
                continue;
            }
            if child.exists {
                plan.keys.insert(child.key.clone());
            } else {
                plan.not_found.insert(child.key.clone());
            }
        }

        for dependent_id in &node.referenced_by {
            let dependent = &self.nodes[*dependent_id];
            if !dependent.is_manifest() {
                continue;
            }
            if !allow_cascade {
                return Err(ShippingError::DependentBackup {
                    key: node.key.clone(),
                    dependent: dependent.key.clone(),
                });
            }
            self.visit_for_deletion(*dependent_id, allow_cascade, plan, visited)?;
        }
        Ok(())
    }
}
