//! Reuse of earlier discovery results for the same paper and policy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::layers::result::RelatedPaperDiscoveryResult;

#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    async fn get(&self, paper_id: &str, fingerprint: &str) -> Option<Arc<RelatedPaperDiscoveryResult>>;

    async fn put(&self, paper_id: &str, fingerprint: &str, result: Arc<RelatedPaperDiscoveryResult>);

    /// Forget every stored result for a paper, whatever the policy.
    async fn invalidate(&self, paper_id: &str);
}

/// Process-local store, bounded by entry count.
pub struct InMemoryDiscoveryStore {
    results: RwLock<HashMap<(String, String), Arc<RelatedPaperDiscoveryResult>>>,
    max_entries: usize,
}

impl Default for InMemoryDiscoveryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDiscoveryStore {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            results: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl DiscoveryStore for InMemoryDiscoveryStore {
    async fn get(&self, paper_id: &str, fingerprint: &str) -> Option<Arc<RelatedPaperDiscoveryResult>> {
        let results = self.results.read().await;
        let hit = results.get(&(paper_id.to_string(), fingerprint.to_string())).cloned();
        if hit.is_some() {
            debug!(paper = paper_id, "Discovery store hit");
        }
        hit
    }

    async fn put(&self, paper_id: &str, fingerprint: &str, result: Arc<RelatedPaperDiscoveryResult>) {
        let mut results = self.results.write().await;
        let key = (paper_id.to_string(), fingerprint.to_string());

        // Evict the oldest completed result when full.
        if results.len() >= self.max_entries && !results.contains_key(&key) {
            let oldest = results
                .iter()
                .min_by_key(|(_, r)| r.completed_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!(paper = %oldest.0, "Evicting stored discovery");
                results.remove(&oldest);
            }
        }
        results.insert(key, result);
        info!(paper = paper_id, stored = results.len(), "Discovery result stored");
    }

    async fn invalidate(&self, paper_id: &str) {
        self.results.write().await.retain(|(id, _), _| id != paper_id);
    }
}
