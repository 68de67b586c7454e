//! Change notifications
//!
//! Published on a tokio broadcast channel after an append is durable or a
//! cascade node settles. Delivery is at-least-once from the consumer's
//! point of view: anything keyed on `delta_id` must tolerate repeats.

use blobflow_delta::{BlobId, Delta, DeltaId, DeltaOperation, ProviderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "blob.created")]
    BlobCreated,
    #[serde(rename = "blob.updated")]
    BlobUpdated,
    #[serde(rename = "blob.deleted")]
    BlobDeleted,
    #[serde(rename = "delta.applied")]
    DeltaApplied,
    #[serde(rename = "processing.complete")]
    ProcessingComplete,
    #[serde(rename = "processing.failed")]
    ProcessingFailed,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlobCreated => "blob.created",
            Self::BlobUpdated => "blob.updated",
            Self::BlobDeleted => "blob.deleted",
            Self::DeltaApplied => "delta.applied",
            Self::ProcessingComplete => "processing.complete",
            Self::ProcessingFailed => "processing.failed",
        }
    }

    /// Blob-level event for an accepted delta
    #[must_use]
    pub fn for_operation(operation: DeltaOperation) -> Self {
        match operation {
            DeltaOperation::Create => Self::BlobCreated,
            DeltaOperation::Update | DeltaOperation::Transform | DeltaOperation::Revert => {
                Self::BlobUpdated
            }
            DeltaOperation::Delete => Self::BlobDeleted,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub blob_id: BlobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_id: Option<DeltaId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(kind: ChangeKind, blob_id: BlobId) -> Self {
        Self {
            kind,
            blob_id,
            delta_id: None,
            user_id: None,
            provider_id: None,
            error: None,
            at: Utc::now(),
        }
    }

    /// Event describing an accepted delta
    #[must_use]
    pub fn for_delta(kind: ChangeKind, delta: &Delta) -> Self {
        Self {
            kind,
            blob_id: delta.blob_id,
            delta_id: Some(delta.id),
            user_id: Some(delta.user_id.clone()),
            provider_id: Some(delta.provider_id.clone()),
            error: None,
            at: delta.applied_at.unwrap_or_else(Utc::now),
        }
    }

    #[must_use]
    pub fn with_delta(mut self, delta: DeltaId) -> Self {
        self.delta_id = Some(delta);
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider_id = Some(provider);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Fan-out of change events to any number of subscribers
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Notifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; no subscribers is not an error
    pub fn publish(&self, event: ChangeEvent) {
        tracing::trace!(kind = %event.kind, blob = %event.blob_id, "notify");
        let _ = self.tx.send(event);
    }

    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
