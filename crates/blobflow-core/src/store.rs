//! Delta store boundary
//!
//! The log is the only durable state. [`DeltaStore`] is the seam where a
//! persistent backend plugs in; [`MemoryDeltaStore`] keeps everything in
//! process.

use crate::error::StoreError;
use blobflow_delta::{BlobId, Delta, DeltaId};
use dashmap::DashMap;

/// Append-only storage of delta chains
#[async_trait::async_trait]
pub trait DeltaStore: Send + Sync {
    /// Persist an accepted delta
    ///
    /// Must atomically check that `delta.version` is exactly one greater
    /// than the stored head for its blob.
    async fn append(&self, delta: Delta) -> Result<(), StoreError>;

    /// Full chain of a blob, oldest first; empty if the blob is unknown
    async fn chain(&self, blob: BlobId) -> Result<Vec<Delta>, StoreError>;

    /// Highest stored version, 0 if none
    async fn head_version(&self, blob: BlobId) -> Result<u64, StoreError>;

    async fn get_delta(&self, id: DeltaId) -> Result<Option<Delta>, StoreError>;

    /// Every blob with at least one delta
    async fn blob_ids(&self) -> Result<Vec<BlobId>, StoreError>;
}

/// In-process store backed by concurrent maps
#[derive(Debug, Default)]
pub struct MemoryDeltaStore {
    chains: DashMap<BlobId, Vec<Delta>>,
    /// Delta id to (blob, position in chain)
    index: DashMap<DeltaId, (BlobId, usize)>,
}

impl MemoryDeltaStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total deltas across all blobs
    #[must_use]
    pub fn delta_count(&self) -> usize {
        self.index.len()
    }
}

#[async_trait::async_trait]
impl DeltaStore for MemoryDeltaStore {
    async fn append(&self, delta: Delta) -> Result<(), StoreError> {
        let mut chain = self.chains.entry(delta.blob_id).or_default();
        if self.index.contains_key(&delta.id) {
            return Err(StoreError::DuplicateDelta(delta.id));
        }
        let head = chain.last().map_or(0, |d| d.version);
        if delta.version != head + 1 {
            return Err(StoreError::VersionConflict {
                blob: delta.blob_id,
                expected: delta.version,
                found: head,
            });
        }
        self.index.insert(delta.id, (delta.blob_id, chain.len()));
        chain.push(delta);
        Ok(())
    }

    async fn chain(&self, blob: BlobId) -> Result<Vec<Delta>, StoreError> {
        Ok(self
            .chains
            .get(&blob)
            .map(|chain| chain.clone())
            .unwrap_or_default())
    }

    async fn head_version(&self, blob: BlobId) -> Result<u64, StoreError> {
        Ok(self
            .chains
            .get(&blob)
            .and_then(|chain| chain.last().map(|d| d.version))
            .unwrap_or(0))
    }

    async fn get_delta(&self, id: DeltaId) -> Result<Option<Delta>, StoreError> {
        let Some(location) = self.index.get(&id).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        let (blob, position) = location;
        Ok(self
            .chains
            .get(&blob)
            .and_then(|chain| chain.get(position).cloned()))
    }

    async fn blob_ids(&self) -> Result<Vec<BlobId>, StoreError> {
        let mut ids: Vec<BlobId> = self
            .chains
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
