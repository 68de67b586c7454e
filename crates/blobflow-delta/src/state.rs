//! Materialized blob state and provider processing records

use crate::fingerprint::{Fingerprint, FingerprintError};
use crate::ids::{BlobId, DeltaId, ProviderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Processing status of one provider for one blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl ProviderStatus {
    /// Returns true if the provider will not touch the blob again for this trigger
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Per (blob, provider) processing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderState {
    pub status: ProviderStatus,
    /// Upstream version the provider last handled
    pub last_processed_version: u64,
    /// Delta whose cascade produced this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trigger: Option<DeltaId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderState {
    #[inline]
    #[must_use]
    pub fn new(status: ProviderStatus, last_processed_version: u64) -> Self {
        Self {
            status,
            last_processed_version,
            last_trigger: None,
            error: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_trigger(mut self, trigger: DeltaId) -> Self {
        self.last_trigger = Some(trigger);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Materialized view of a blob at one version
///
/// Never stored on its own: always the result of folding the delta chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobState {
    pub blob_id: BlobId,
    pub user_id: UserId,
    pub content: serde_json::Value,
    pub content_type: String,
    /// Version of the last applied delta
    pub version: u64,
    /// Id of the last applied delta
    pub head: DeltaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<BlobId>,
    /// Derived children in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_ids: Vec<BlobId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_status: BTreeMap<ProviderId, ProviderState>,
    /// Tombstone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlobState {
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Canonical JSON encoding
    ///
    /// # Errors
    /// Returns error if the content cannot be serialized
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, FingerprintError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Blake3 fingerprint of the canonical encoding
    ///
    /// # Errors
    /// Returns error if the content cannot be serialized
    pub fn fingerprint(&self) -> Result<Fingerprint, FingerprintError> {
        Fingerprint::of(self)
    }

    /// Record a child in declaration order, ignoring repeats
    pub(crate) fn push_child(&mut self, child: BlobId) {
        if !self.child_ids.contains(&child) {
            self.child_ids.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ProviderStatus::Completed.is_terminal());
        assert!(ProviderStatus::Failed.is_terminal());
        assert!(ProviderStatus::Skipped.is_terminal());
        assert!(!ProviderStatus::Pending.is_terminal());
        assert!(!ProviderStatus::Processing.is_terminal());
    }

    #[test]
    fn provider_state_builder() {
        let trigger = DeltaId::new();
        let state = ProviderState::new(ProviderStatus::Failed, 3)
            .with_trigger(trigger)
            .with_error("timeout");
        assert_eq!(state.last_trigger, Some(trigger));
        assert_eq!(state.error.as_deref(), Some("timeout"));
        assert_eq!(state.last_processed_version, 3);
    }
}
