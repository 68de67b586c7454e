//! Dispatch boundary between the cascade processor and providers
//!
//! The processor never calls a provider directly. It hands a
//! [`DispatchRequest`] to a [`Dispatcher`] and gets back a
//! [`DispatchResult`]; how the provider runs is the dispatcher's concern.

use blobflow_delta::{BlobId, Delta, DeltaId, DeltaOperation, ProviderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What happened to the root blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Created,
    Updated,
    Deleted,
}

impl TriggerEvent {
    /// Map a delta operation to the event it fires
    ///
    /// Transforms and reverts change content, so they count as updates.
    #[must_use]
    pub fn from_operation(operation: DeltaOperation) -> Self {
        match operation {
            DeltaOperation::Create => Self::Created,
            DeltaOperation::Update | DeltaOperation::Transform | DeltaOperation::Revert => {
                Self::Updated
            }
            DeltaOperation::Delete => Self::Deleted,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The accepted delta that started a cascade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Blob the delta was applied to
    pub root: BlobId,
    /// Version the root reached with this delta
    pub root_version: u64,
    pub delta_id: DeltaId,
    pub event: TriggerEvent,
}

impl Trigger {
    #[must_use]
    pub fn from_delta(delta: &Delta) -> Self {
        Self {
            root: delta.blob_id,
            root_version: delta.version,
            delta_id: delta.id,
            event: TriggerEvent::from_operation(delta.operation),
        }
    }
}

/// One unit of work for one provider on one blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub provider_id: ProviderId,
    /// Descendant the provider should update
    pub blob_id: BlobId,
    pub trigger: Trigger,
    /// Wall-clock deadline after which the result is discarded
    pub deadline: DateTime<Utc>,
}

impl DispatchRequest {
    #[inline]
    #[must_use]
    pub fn event(&self) -> TriggerEvent {
        self.trigger.event
    }

    /// Time left before the deadline, zero if already passed
    #[must_use]
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Outcome of a single dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    /// Provider declined, or there was nothing to do
    Skipped,
    /// Provider output was appended as this delta
    Completed(DeltaId),
    Failed(DispatchError),
}

impl DispatchResult {
    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Why a dispatch failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("no provider registered as '{0}'")]
    UnknownProvider(ProviderId),

    #[error("provider failed: {message}")]
    Provider { message: String, transient: bool },

    /// The blob moved on while the provider was working
    #[error("version conflict writing {blob}: expected {expected}, head is {found}")]
    Conflict {
        blob: BlobId,
        expected: u64,
        found: u64,
    },

    #[error("gateway rejected provider output: {0}")]
    Gateway(String),

    #[error("dispatch task panicked: {0}")]
    Panicked(String),

    #[error("cascade cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Whether a fresh attempt could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { transient, .. } => *transient,
            Self::Conflict { .. } => true,
            Self::Timeout(_)
            | Self::UnknownProvider(_)
            | Self::Gateway(_)
            | Self::Panicked(_)
            | Self::Cancelled => false,
        }
    }
}

/// Delivers work to providers
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run one provider against one blob
    ///
    /// Implementations report failures in the result rather than
    /// panicking; the processor treats a panic as a failure of that node.
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult;
}
