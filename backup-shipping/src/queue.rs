//! Shipments waiting for a node.
//!
//! Each item is stored once and referenced by key from either the node queues of all of its
//! candidates or from the undecided queue of its remote. Taking an item removes every reference,
//! so an item is never in two queue kinds and never queued while shipping.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ShipmentKey, ShipmentRequest};
use crate::utils::errors::{Result, ShippingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub request: ShipmentRequest,
    /// Base snapshot of the incremental chain
    pub prev_snap: Option<String>,
    pub candidates: BTreeSet<String>,
    /// Destination decides placement (cross-cluster shipment)
    pub awaiting_placement: bool,
}

impl QueueItem {
    pub fn key(&self) -> ShipmentKey {
        self.request.key()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShipmentQueues {
    items: BTreeMap<ShipmentKey, QueueItem>,
    /// Node name to FIFO of queued shipments
    node_queues: BTreeMap<String, Vec<ShipmentKey>>,
    /// Remote name to FIFO of shipments without candidates
    undecided: BTreeMap<String, Vec<ShipmentKey>>,
}

impl ShipmentQueues {
    /// Queues `item` on every candidate node, or on its remote's undecided queue without candidates.
    /// An already queued item with the same key is replaced.
    pub fn enqueue(&mut self, item: QueueItem) -> Result<()> {
        let key = item.key();
        if item.candidates.is_empty() && item.prev_snap.is_none() && !item.awaiting_placement {
            return Err(ShippingError::Internal(format!(
                "shipment {key} has neither candidate nodes nor a base to wait for"
            )));
        }
        self.take(&key);

        if item.candidates.is_empty() {
            self.undecided
                .entry(item.request.remote_name.clone())
                .or_default()
                .push(key.clone());
        } else {
            for node in &item.candidates {
                self.node_queues
                    .entry(node.clone())
                    .or_default()
                    .push(key.clone());
            }
        }
        self.items.insert(key, item);
        Ok(())
    }

    /// Removes the item from every queue.
    pub fn take(&mut self, key: &ShipmentKey) -> Option<QueueItem> {
        let item = self.items.remove(key)?;
        for node in &item.candidates {
            if let Some(queue) = self.node_queues.get_mut(node) {
                queue.retain(|k| k != key);
                if queue.is_empty() {
                    self.node_queues.remove(node);
                }
            }
        }
        let remote = &item.request.remote_name;
        if let Some(queue) = self.undecided.get_mut(remote) {
            queue.retain(|k| k != key);
            if queue.is_empty() {
                self.undecided.remove(remote);
            }
        }
        Some(item)
    }

    pub fn get(&self, key: &ShipmentKey) -> Option<&QueueItem> {
        self.items.get(key)
    }

    pub fn is_queued(&self, key: &ShipmentKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queue order of `node`.
    pub fn node_queue(&self, node: &str) -> Vec<ShipmentKey> {
        self.node_queues.get(node).cloned().unwrap_or_default()
    }

    pub fn undecided_queue(&self, remote: &str) -> Vec<ShipmentKey> {
        self.undecided.get(remote).cloned().unwrap_or_default()
    }

    /// Number of queue kinds holding `key` (0 or 1).
    pub fn membership(&self, key: &ShipmentKey) -> usize {
        let in_node = self.node_queues.values().any(|q| q.contains(key));
        let in_undecided = self.undecided.values().any(|q| q.contains(key));
        usize::from(in_node) + usize::from(in_undecided)
    }

    /// Takes every item queued on `node`. The items are gone from all queues afterwards.
    pub fn remove_node(&mut self, node: &str) -> Vec<QueueItem> {
        let keys = self.node_queues.remove(node).unwrap_or_default();
        keys.iter().filter_map(|k| self.take(k)).collect()
    }

    /// Undecided items of `remote` waiting for `prev_snap` of `rsc_name`.
    pub fn take_undecided_for_prev(&mut self, remote: &str, rsc_name: &str, prev_snap: &str) -> Vec<QueueItem> {
        let keys: Vec<ShipmentKey> = self
            .undecided_queue(remote)
            .into_iter()
            .filter(|k| {
                self.items.get(k).is_some_and(|item| {
                    item.request.rsc_name == rsc_name && item.prev_snap.as_deref() == Some(prev_snap)
                })
            })
            .collect();
        keys.iter().filter_map(|k| self.take(k)).collect()
    }

    /// Queued shipments, in any queue, whose base is `rsc_name/snap_name`.
    pub fn follow_ups(&self, rsc_name: &str, snap_name: &str) -> Vec<ShipmentKey> {
        self.items
            .values()
            .filter(|item| {
                item.request.rsc_name == rsc_name && item.prev_snap.as_deref() == Some(snap_name)
            })
            .map(QueueItem::key)
            .collect()
    }

    /// Keys queued for a resource, optionally only those for one remote.
    pub fn keys_for_resource(&self, rsc_name: &str, remote: Option<&str>) -> Vec<ShipmentKey> {
        self.items
            .keys()
            .filter(|k| k.rsc_name == rsc_name && remote.map_or(true, |r| k.remote_name == r))
            .cloned()
            .collect()
    }

    pub fn remove_remote(&mut self, remote: &str) -> Vec<QueueItem> {
        let keys: Vec<ShipmentKey> = self
            .items
            .keys()
            .filter(|k| k.remote_name == remote)
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.take(k)).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.node_queues.clear();
        self.undecided.clear();
    }

    /// Forgets a deleted base snapshot. Affected items become full backups; undecided ones are
    /// returned since they have nothing to wait for anymore.
    pub fn drop_prev_snapshot(&mut self, rsc_name: &str, snap_name: &str) -> Vec<QueueItem> {
        let mut released = Vec::new();
        for key in self.follow_ups(rsc_name, snap_name) {
            let undecided = self
                .items
                .get(&key)
                .is_some_and(|item| item.candidates.is_empty() && !item.awaiting_placement);
            if undecided {
                if let Some(mut item) = self.take(&key) {
                    item.prev_snap = None;
                    released.push(item);
                }
            } else if let Some(item) = self.items.get_mut(&key) {
                item.prev_snap = None;
            }
        }
        released
    }
}
