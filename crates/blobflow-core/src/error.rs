//! Error types for the Blobflow engine
//!
//! [`EngineError`] is what callers of [`ContentEngine`] see:
//! - validation failures (malformed or inapplicable deltas)
//! - version conflicts (stale optimistic version)
//! - cycle rejections (structural edge refused by the DAG)
//! - dispatch timeouts and failures (cascade-time, per node)
//! - missing blobs, deltas or parents
//!
//! [`ContentEngine`]: crate::ContentEngine

use blobflow_cascade::{CascadeReport, DispatchError, GatewayError};
use blobflow_delta::{BlobId, DeltaError, DeltaId, MaterializeError};
use blobflow_graph::GraphError;
use std::time::Duration;

/// Main engine error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Malformed delta or patch that cannot apply to the current state
    #[error("validation failed: {0}")]
    Validation(String),

    /// Stale version on append; re-read and retry
    #[error("version conflict on {blob}: expected {expected}, head is {found}")]
    VersionConflict {
        blob: BlobId,
        /// Version the rejected delta carried
        expected: u64,
        /// Current head version
        found: u64,
    },

    /// Structural edge refused; the delta itself was still logged
    #[error("cycle rejected: {0}")]
    CycleRejected(#[from] GraphError),

    #[error("dispatch for {blob} timed out after {after:?}")]
    DispatchTimeout { blob: BlobId, after: Duration },

    #[error("dispatch for {blob} failed: {reason}")]
    DispatchFailure { blob: BlobId, reason: String },

    #[error("blob not found: {0}")]
    BlobNotFound(BlobId),

    #[error("delta not found: {0}")]
    DeltaNotFound(DeltaId),

    #[error("{blob} has no version {version}")]
    VersionNotFound { blob: BlobId, version: u64 },

    #[error("parent {0} does not exist or is deleted")]
    ParentNotFound(BlobId),

    /// A stored chain no longer folds
    #[error("materialization failed: {0}")]
    Materialize(#[from] MaterializeError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the same request could succeed later
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::DispatchTimeout { .. } | Self::DispatchFailure { .. }
        )
    }

    /// Stable tag for logs and notifications
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::VersionConflict { .. } => "version_conflict",
            Self::CycleRejected(_) => "cycle_rejected",
            Self::DispatchTimeout { .. } => "dispatch_timeout",
            Self::DispatchFailure { .. } => "dispatch_failure",
            Self::BlobNotFound(_)
            | Self::DeltaNotFound(_)
            | Self::VersionNotFound { .. }
            | Self::ParentNotFound(_) => "not_found",
            Self::Materialize(_) => "materialize",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
        }
    }

    /// Map a per-node cascade failure to the caller-facing taxonomy
    #[must_use]
    pub fn from_dispatch(blob: BlobId, err: &DispatchError) -> Self {
        match err {
            DispatchError::Timeout(after) => Self::DispatchTimeout {
                blob,
                after: *after,
            },
            other => Self::DispatchFailure {
                blob,
                reason: other.to_string(),
            },
        }
    }

    /// Every failed node of a cascade, in report order
    #[must_use]
    pub fn from_report(report: &CascadeReport) -> Vec<Self> {
        report
            .failures()
            .into_iter()
            .map(|(blob, err)| Self::from_dispatch(blob, err))
            .collect()
    }
}

impl From<DeltaError> for EngineError {
    fn from(err: DeltaError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<EngineError> for GatewayError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::VersionConflict {
                blob,
                expected,
                found,
            } => Self::VersionConflict {
                blob,
                expected,
                found,
            },
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// Delta store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Append raced with another writer or carried a stale version
    #[error("version conflict on {blob}: expected {expected}, head is {found}")]
    VersionConflict {
        blob: BlobId,
        expected: u64,
        found: u64,
    },

    #[error("delta {0} already stored")]
    DuplicateDelta(DeltaId),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Lift into the engine taxonomy, keeping conflicts distinct
    #[must_use]
    pub fn into_engine(self) -> EngineError {
        match self {
            Self::VersionConflict {
                blob,
                expected,
                found,
            } => EngineError::VersionConflict {
                blob,
                expected,
                found,
            },
            other => EngineError::Store(other),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        err.into_engine()
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
