//! Delta records
//!
//! A [`Delta`] is the unit of the append-only log. Once accepted it is
//! never mutated; corrections are new deltas with [`DeltaOperation::Revert`].

use crate::ids::{BlobId, DeltaId, ProviderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Kind of change a delta records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOperation {
    /// First delta of a blob; initializes content and parent
    Create,
    /// Patch the content
    Update,
    /// Patch the content and declare derived children
    Transform,
    /// Tombstone the blob
    Delete,
    /// Restore the state as of an earlier delta
    Revert,
}

impl DeltaOperation {
    /// Whether this operation may carry `parent_id`/`child_ids`
    #[inline]
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Create | Self::Transform | Self::Revert)
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Transform => "transform",
            Self::Delete => "delete",
            Self::Revert => "revert",
        }
    }
}

impl fmt::Display for DeltaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation payload
///
/// The core never interprets content beyond JSON merge semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Patch {
    /// Initial content of a blob
    Init {
        content: serde_json::Value,
        content_type: String,
    },
    /// Full replacement of the content
    Replace { content: serde_json::Value },
    /// JSON merge-patch applied to object content; `null` removes a key
    Merge { diff: serde_json::Value },
    /// No payload (delete, revert)
    None,
}

impl Patch {
    fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Replace { .. } => "replace",
            Self::Merge { .. } => "merge",
            Self::None => "none",
        }
    }

    fn fits(&self, operation: DeltaOperation) -> bool {
        match operation {
            DeltaOperation::Create => matches!(self, Self::Init { .. }),
            DeltaOperation::Update | DeltaOperation::Transform => {
                matches!(self, Self::Replace { .. } | Self::Merge { .. })
            }
            DeltaOperation::Delete | DeltaOperation::Revert => matches!(self, Self::None),
        }
    }
}

/// Atomic, immutable change record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub id: DeltaId,
    /// Blob this delta changes
    pub blob_id: BlobId,
    pub user_id: UserId,
    /// Originating provider, `user` for direct edits
    pub provider_id: ProviderId,
    pub operation: DeltaOperation,
    pub patch: Patch,
    /// Blob this one derives from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<BlobId>,
    /// Blobs this delta spawns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_ids: Vec<BlobId>,
    /// Delta that logically caused this one; the restore point for reverts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<DeltaId>,
    /// Monotonic per-blob version, starting at 1
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Set once by the log on acceptance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl Delta {
    /// Start building a delta for `blob_id`
    #[inline]
    #[must_use]
    pub fn builder(blob_id: BlobId, operation: DeltaOperation) -> DeltaBuilder {
        DeltaBuilder::new(blob_id, operation)
    }

    /// Whether the log has accepted this delta
    #[inline]
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.applied_at.is_some()
    }

    /// Whether the delta declares any DAG edge
    #[inline]
    #[must_use]
    pub fn has_structure(&self) -> bool {
        self.parent_id.is_some() || !self.child_ids.is_empty()
    }

    /// Stamp the application time; a no-op on an already accepted delta
    #[must_use]
    pub fn accept(mut self, at: DateTime<Utc>) -> Self {
        if self.applied_at.is_none() {
            self.applied_at = Some(at);
        }
        self
    }

    /// Check the record is well-formed on its own
    ///
    /// Does not look at any other delta; version ordering and parent
    /// existence are the log's business.
    ///
    /// # Errors
    /// Returns the first shape violation found
    pub fn validate_shape(&self) -> Result<(), DeltaError> {
        if self.user_id.as_str().is_empty() {
            return Err(DeltaError::MissingField("user_id"));
        }
        if self.provider_id.as_str().is_empty() {
            return Err(DeltaError::MissingField("provider_id"));
        }
        if self.version == 0 {
            return Err(DeltaError::InvalidVersion);
        }
        if !self.patch.fits(self.operation) {
            return Err(DeltaError::PatchMismatch {
                operation: self.operation,
                patch: self.patch.name(),
            });
        }
        if self.operation == DeltaOperation::Create && self.version != 1 {
            return Err(DeltaError::InvalidVersion);
        }
        if self.operation == DeltaOperation::Revert && self.caused_by.is_none() {
            return Err(DeltaError::MissingField("caused_by"));
        }
        if self.has_structure() && !self.operation.is_structural() {
            return Err(DeltaError::StructureNotAllowed(self.operation));
        }
        if self.parent_id == Some(self.blob_id) || self.child_ids.contains(&self.blob_id) {
            return Err(DeltaError::SelfReference(self.blob_id));
        }
        let mut seen = HashSet::with_capacity(self.child_ids.len());
        for child in &self.child_ids {
            if !seen.insert(child) {
                return Err(DeltaError::DuplicateChild(*child));
            }
            if Some(*child) == self.parent_id {
                return Err(DeltaError::SelfReference(*child));
            }
        }
        Ok(())
    }
}

/// Errors in the shape of a single delta
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("version must be >= 1 (and exactly 1 for create)")]
    InvalidVersion,

    #[error("patch '{patch}' does not fit operation '{operation}'")]
    PatchMismatch {
        operation: DeltaOperation,
        patch: &'static str,
    },

    #[error("operation '{0}' cannot declare structural fields")]
    StructureNotAllowed(DeltaOperation),

    #[error("blob {0} references itself")]
    SelfReference(BlobId),

    #[error("child {0} declared twice")]
    DuplicateChild(BlobId),
}

/// Builder for constructing deltas
#[derive(Debug, Clone)]
pub struct DeltaBuilder {
    blob_id: BlobId,
    operation: DeltaOperation,
    user_id: Option<UserId>,
    provider_id: Option<ProviderId>,
    patch: Patch,
    parent_id: Option<BlobId>,
    child_ids: Vec<BlobId>,
    caused_by: Option<DeltaId>,
    version: u64,
    created_at: Option<DateTime<Utc>>,
}

impl DeltaBuilder {
    #[inline]
    #[must_use]
    pub fn new(blob_id: BlobId, operation: DeltaOperation) -> Self {
        Self {
            blob_id,
            operation,
            user_id: None,
            provider_id: None,
            patch: Patch::None,
            parent_id: None,
            child_ids: Vec::new(),
            caused_by: None,
            version: 1,
            created_at: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user_id = Some(UserId::new(user));
        self
    }

    /// Originating provider; defaults to `user`
    #[inline]
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider_id = Some(ProviderId::new(provider));
        self
    }

    #[inline]
    #[must_use]
    pub fn patch(mut self, patch: Patch) -> Self {
        self.patch = patch;
        self
    }

    /// Shorthand for an `Init` patch
    #[inline]
    #[must_use]
    pub fn init(self, content: serde_json::Value, content_type: impl Into<String>) -> Self {
        self.patch(Patch::Init {
            content,
            content_type: content_type.into(),
        })
    }

    /// Shorthand for a `Replace` patch
    #[inline]
    #[must_use]
    pub fn replace(self, content: serde_json::Value) -> Self {
        self.patch(Patch::Replace { content })
    }

    /// Shorthand for a `Merge` patch
    #[inline]
    #[must_use]
    pub fn merge(self, diff: serde_json::Value) -> Self {
        self.patch(Patch::Merge { diff })
    }

    #[inline]
    #[must_use]
    pub fn parent(mut self, parent: BlobId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    #[inline]
    #[must_use]
    pub fn child(mut self, child: BlobId) -> Self {
        self.child_ids.push(child);
        self
    }

    #[inline]
    #[must_use]
    pub fn caused_by(mut self, delta: DeltaId) -> Self {
        self.caused_by = Some(delta);
        self
    }

    #[inline]
    #[must_use]
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Fix the creation time (deterministic fixtures)
    #[inline]
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Build and shape-check the delta
    ///
    /// # Errors
    /// Returns error if a required field is missing or the shape is invalid
    pub fn build(self) -> Result<Delta, DeltaError> {
        let user_id = self.user_id.ok_or(DeltaError::MissingField("user_id"))?;
        let delta = Delta {
            id: DeltaId::new(),
            blob_id: self.blob_id,
            user_id,
            provider_id: self.provider_id.unwrap_or_else(ProviderId::user),
            operation: self.operation,
            patch: self.patch,
            parent_id: self.parent_id,
            child_ids: self.child_ids,
            caused_by: self.caused_by,
            version: self.version,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            applied_at: None,
        };
        delta.validate_shape()?;
        Ok(delta)
    }
}
