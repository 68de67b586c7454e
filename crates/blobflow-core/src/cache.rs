//! Materialized state cache using moka
//!
//! Entries are a convenience, never the truth: a hit is only served if
//! its version still matches the log head, otherwise the fold resumes
//! from the cached state.

use blobflow_delta::{BlobId, BlobState};
use moka::future::Cache;
use std::sync::Arc;

/// Latest materialized state per blob
#[derive(Debug, Clone)]
pub struct StateCache {
    inner: Cache<BlobId, Arc<BlobState>>,
}

impl StateCache {
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    #[inline]
    pub async fn insert(&self, state: BlobState) {
        self.inner.insert(state.blob_id, Arc::new(state)).await;
    }

    #[inline]
    pub async fn get(&self, blob: BlobId) -> Option<Arc<BlobState>> {
        self.inner.get(&blob).await
    }

    #[inline]
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}
