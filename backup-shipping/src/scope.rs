//! Lock scopes over the shared cluster state.
//!
//! Bodies are synchronous, so no lock is ever held across a network await. A write scope works on
//! a copy and swaps it in only when the body succeeds; a failing body leaves nothing behind.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::ClusterState;
use crate::utils::errors::Result;

#[derive(Clone)]
pub struct ClusterStore {
    state: Arc<RwLock<ClusterState>>,
}

impl ClusterStore {
    pub fn new(state: ClusterState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Runs `body` under the read lock.
    pub async fn read<T, F>(&self, scope: &str, body: F) -> Result<T>
    where
        F: FnOnce(&ClusterState) -> Result<T>,
    {
        let guard = self.state.read().await;
        let span = tracing::debug_span!("scope", name = %scope, mode = "read");
        let _enter = span.enter();
        debug!("Entering scope");
        let result = body(&guard);
        debug!(ok = result.is_ok(), "Leaving scope");
        result
    }

    /// Runs `body` under the write lock and commits its changes only on success.
    pub async fn write<T, F>(&self, scope: &str, body: F) -> Result<T>
    where
        F: FnOnce(&mut ClusterState) -> Result<T>,
    {
        let mut guard = self.state.write().await;
        let span = tracing::debug_span!("scope", name = %scope, mode = "write");
        let _enter = span.enter();
        debug!("Entering scope");

        let mut working = guard.clone();
        match body(&mut working) {
            Ok(value) => {
                *guard = working;
                debug!("Committed scope");
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "Rolled back scope");
                Err(err)
            }
        }
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> ClusterState {
        self.state.read().await.clone()
    }
}
