//! Per (blob, provider) processing records

use blobflow_delta::{BlobId, DeltaId, ProviderId, ProviderState, ProviderStatus};
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Shared record of what each provider last did for each blob
///
/// Cascades running for different roots write disjoint or commuting
/// entries, so a concurrent map is enough.
#[derive(Debug, Default)]
pub struct ProviderLedger {
    entries: DashMap<BlobId, BTreeMap<ProviderId, ProviderState>>,
}

impl ProviderLedger {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, blob: BlobId, provider: ProviderId, state: ProviderState) {
        self.entries.entry(blob).or_default().insert(provider, state);
    }

    #[must_use]
    pub fn get(&self, blob: BlobId, provider: &ProviderId) -> Option<ProviderState> {
        self.entries
            .get(&blob)
            .and_then(|providers| providers.get(provider).cloned())
    }

    /// All records for a blob, ordered by provider id
    #[must_use]
    pub fn for_blob(&self, blob: BlobId) -> BTreeMap<ProviderId, ProviderState> {
        self.entries
            .get(&blob)
            .map(|providers| providers.clone())
            .unwrap_or_default()
    }

    /// Whether this provider already finished this blob for this trigger
    ///
    /// Lets a redelivered trigger be acknowledged without running the
    /// provider twice. Only records stamped with `trigger` count, so nodes
    /// the cascade skipped on its own (failed ancestor, tombstone) are
    /// dispatched when the trigger runs again.
    #[must_use]
    pub fn already_handled(&self, blob: BlobId, provider: &ProviderId, trigger: DeltaId) -> bool {
        self.get(blob, provider).is_some_and(|state| {
            state.last_trigger == Some(trigger)
                && matches!(
                    state.status,
                    ProviderStatus::Completed | ProviderStatus::Skipped
                )
        })
    }

    /// Drop every record for a blob
    pub fn forget(&self, blob: BlobId) {
        self.entries.remove(&blob);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    #[inline]
    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.entries.len()
    }
}
