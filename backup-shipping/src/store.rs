//! Remote object store seam.
//!
//! The scheduler never talks to S3-like services directly. It sees an [`ObjectStore`] that can list
//! keys, read manifests and delete keys. Listings are fetched outside of any cluster-state scope
//! into a [`RemoteListing`], which the graph and catalog then consume synchronously.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::key;
use crate::manifest::BackupManifest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Could not decode {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Result of a (possibly partial) bulk delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All keys starting with `prefix` (empty prefix lists the whole bucket).
    async fn list_keys(&self, prefix: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Fetch and decode a manifest body.
    async fn get_manifest(&self, key: &str) -> Result<BackupManifest, StoreError>;

    /// Delete the given keys. Individual keys may fail without failing the call.
    async fn delete_keys(&self, keys: &BTreeSet<String>) -> Result<DeleteOutcome, StoreError>;
}

/// A key that was skipped while scanning a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIssue {
    pub key: String,
    pub error: StoreError,
}

/// Snapshot of a remote listing with every parseable manifest already fetched.
#[derive(Debug, Clone, Default)]
pub struct RemoteListing {
    pub keys: BTreeSet<String>,
    pub manifests: BTreeMap<String, BackupManifest>,
    pub issues: Vec<ScanIssue>,
}

impl RemoteListing {
    /// Lists `prefix` and fetches every manifest key. Manifest read failures are recorded as issues
    /// and the key is skipped; only a failing listing aborts.
    pub async fn fetch(store: &dyn ObjectStore, prefix: &str) -> Result<Self, StoreError> {
        let keys = store.list_keys(prefix).await?;
        let mut listing = RemoteListing {
            keys,
            ..Default::default()
        };

        let manifest_keys: Vec<String> = listing
            .keys
            .iter()
            .filter(|k| key::parse_manifest_key(k).is_some())
            .cloned()
            .collect();

        for manifest_key in manifest_keys {
            match store.get_manifest(&manifest_key).await {
                Ok(manifest) => {
                    listing.manifests.insert(manifest_key, manifest);
                }
                Err(error) => {
                    warn!(key = %manifest_key, error = %error, "Skipping unreadable manifest");
                    listing.issues.push(ScanIssue {
                        key: manifest_key,
                        error,
                    });
                }
            }
        }

        debug!(
            prefix = %prefix,
            keys = listing.keys.len(),
            manifests = listing.manifests.len(),
            "Fetched remote listing"
        );
        Ok(listing)
    }
}

/// In-process object store. Used by tests and for dry runs against a captured bucket.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    undeletable: Arc<RwLock<HashSet<String>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: impl Into<String>, body: Vec<u8>) {
        let mut objects = self.objects.write().await;
        objects.insert(key.into(), body);
    }

    pub async fn put_manifest(&self, key: impl Into<String>, manifest: &BackupManifest) {
        let body = manifest.to_json().unwrap_or_default();
        self.put(key, body).await;
    }

    /// Makes subsequent deletes of `key` fail.
    pub async fn protect(&self, key: impl Into<String>) {
        let mut undeletable = self.undeletable.write().await;
        undeletable.insert(key.into());
    }

    pub async fn contains(&self, key: &str) -> bool {
        let objects = self.objects.read().await;
        objects.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        let objects = self.objects.read().await;
        objects.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_keys(&self, prefix: &str) -> Result<BTreeSet<String>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_manifest(&self, key: &str) -> Result<BackupManifest, StoreError> {
        let objects = self.objects.read().await;
        let body = objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        BackupManifest::from_json(body).map_err(|e| StoreError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    async fn delete_keys(&self, keys: &BTreeSet<String>) -> Result<DeleteOutcome, StoreError> {
        let mut objects = self.objects.write().await;
        let undeletable = self.undeletable.read().await;
        let mut outcome = DeleteOutcome::default();
        for key in keys {
            if undeletable.contains(key) {
                outcome.failed.insert(key.clone());
            } else {
                objects.remove(key);
                outcome.deleted.insert(key.clone());
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn test_fetch_skips_broken_manifest() {
        let store = MemoryObjectStore::new();
        let manifest = test_support::manifest("rsc", "20240101_000000", None, &[0]);
        store.put_manifest("rsc_back_20240101_000000.meta", &manifest).await;
        store.put("rsc_vol0_20240101_000000", vec![1, 2, 3]).await;
        store.put("rsc_back_20240102_000000.meta", b"not json".to_vec()).await;
        store.put("unrelated.txt", vec![]).await;

        let listing = RemoteListing::fetch(&store, "").await.unwrap();
        assert_eq!(listing.keys.len(), 4);
        assert_eq!(listing.manifests.len(), 1);
        assert_eq!(listing.issues.len(), 1);
        assert_eq!(listing.issues[0].key, "rsc_back_20240102_000000.meta");
        assert!(matches!(listing.issues[0].error, StoreError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_fetch_with_prefix() {
        let store = MemoryObjectStore::new();
        store.put("rsc_vol0_20240101_000000", vec![]).await;
        store.put("other_vol0_20240101_000000", vec![]).await;

        let listing = RemoteListing::fetch(&store, "rsc_").await.unwrap();
        assert_eq!(listing.keys.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_delete() {
        let store = MemoryObjectStore::new();
        store.put("a", vec![]).await;
        store.put("b", vec![]).await;
        store.protect("b").await;

        let keys: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        let outcome = store.delete_keys(&keys).await.unwrap();
        assert!(outcome.deleted.contains("a"));
        assert!(outcome.failed.contains("b"));
        assert!(!store.contains("a").await);
        assert!(store.contains("b").await);
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let store = MemoryObjectStore::new();
        let err = store.get_manifest("nope.meta").await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("nope.meta".to_string()));
    }
}
