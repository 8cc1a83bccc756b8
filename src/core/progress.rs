//! In-memory progress of running transfers, keyed by file name.
//!
//! Updated on every status event from the transfer engine. Nothing here is
//! persisted; a finished job removes its entries.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::transfer_engine::TransferStatus;

/// Shared through `AppContext`; cloning shares the same map.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, TransferStatus>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, key: &str, status: TransferStatus) {
        let mut map = self.inner.write().await;
        map.insert(key.to_string(), status);
    }

    pub async fn get(&self, key: &str) -> Option<TransferStatus> {
        let map = self.inner.read().await;
        map.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) {
        let mut map = self.inner.write().await;
        map.remove(key);
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}
