//! Provider registry and the registry-backed dispatcher
//!
//! A [`Provider`] turns the state of a source blob into new content for a
//! derived blob. [`RegistryDispatcher`] looks providers up by id, feeds
//! them the current states through a [`BlobGateway`], and appends their
//! output back through the same gateway.

use crate::dispatch::{DispatchError, DispatchRequest, DispatchResult, Dispatcher, Trigger};
use blobflow_delta::{BlobId, BlobState, Delta, DeltaOperation, ProviderId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything a provider gets to see
#[derive(Debug, Clone)]
pub struct TransformInput {
    /// Blob being derived
    pub blob_id: BlobId,
    pub trigger: Trigger,
    /// Current state of the derived blob, if it has any history
    pub current: Option<BlobState>,
    /// State of the blob it derives from
    pub source: Option<BlobState>,
}

/// What a provider wants written
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutput {
    /// Nothing to change
    Skip,
    /// New full content; `content_type` is only used when the blob is new
    Content {
        content: serde_json::Value,
        content_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Worth another attempt
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("provider failed: {0}")]
    Fatal(String),
}

impl From<ProviderError> for DispatchError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(message) => Self::Provider {
                message,
                transient: true,
            },
            ProviderError::Fatal(message) => Self::Provider {
                message,
                transient: false,
            },
        }
    }
}

/// An external content transformer
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn transform(&self, input: TransformInput) -> Result<ProviderOutput, ProviderError>;
}

/// Providers by id
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<ProviderId, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a provider
    pub fn register(&self, id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(ProviderId::new(id), provider);
    }

    pub fn remove(&self, id: &ProviderId) -> bool {
        self.providers.remove(id).is_some()
    }

    #[must_use]
    pub fn get(&self, id: &ProviderId) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    /// Registered ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<_> = self.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

/// Why the gateway refused a read or write
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("version conflict on {blob}: expected {expected}, head is {found}")]
    VersionConflict {
        blob: BlobId,
        expected: u64,
        found: u64,
    },

    #[error("{0}")]
    Rejected(String),
}

impl From<GatewayError> for DispatchError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::VersionConflict {
                blob,
                expected,
                found,
            } => Self::Conflict {
                blob,
                expected,
                found,
            },
            GatewayError::Rejected(reason) => Self::Gateway(reason),
        }
    }
}

/// Read and write access to blobs for dispatchers
#[async_trait::async_trait]
pub trait BlobGateway: Send + Sync {
    /// Current materialized state, `None` if the blob has no history
    async fn load(&self, blob: BlobId) -> Result<Option<BlobState>, GatewayError>;

    /// Primary parent of a blob in the derivation graph
    fn source_of(&self, blob: BlobId) -> Option<BlobId>;

    /// Append a provider-authored delta, returning the accepted record
    async fn submit(&self, delta: Delta) -> Result<Delta, GatewayError>;
}

/// Retry schedule for one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from the initial backoff
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

/// Dispatcher that runs registered providers against gateway state
pub struct RegistryDispatcher<G> {
    registry: Arc<ProviderRegistry>,
    gateway: Arc<G>,
    retry: RetryPolicy,
}

impl<G: BlobGateway> RegistryDispatcher<G> {
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, gateway: Arc<G>) -> Self {
        Self {
            registry,
            gateway,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    async fn attempt(
        &self,
        provider: &dyn Provider,
        request: &DispatchRequest,
    ) -> Result<DispatchResult, DispatchError> {
        let current = self.gateway.load(request.blob_id).await?;
        if current.as_ref().is_some_and(BlobState::is_deleted) {
            return Ok(DispatchResult::Skipped);
        }

        let source_id = self.gateway.source_of(request.blob_id);
        let source = match source_id {
            Some(id) => self.gateway.load(id).await?,
            None => None,
        };

        let input = TransformInput {
            blob_id: request.blob_id,
            trigger: request.trigger.clone(),
            current: current.clone(),
            source: source.clone(),
        };

        let (content, content_type) = match provider.transform(input).await? {
            ProviderOutput::Skip => return Ok(DispatchResult::Skipped),
            ProviderOutput::Content {
                content,
                content_type,
            } => (content, content_type),
        };

        let delta = match &current {
            Some(state) => Delta::builder(request.blob_id, DeltaOperation::Update)
                .user(state.user_id.as_str())
                .provider(request.provider_id.as_str())
                .replace(content)
                .version(state.version + 1),
            None => {
                let owner = source.as_ref().ok_or_else(|| {
                    DispatchError::Gateway(format!(
                        "cannot create {} without a source blob",
                        request.blob_id
                    ))
                })?;
                let mut builder = Delta::builder(request.blob_id, DeltaOperation::Create)
                    .user(owner.user_id.as_str())
                    .provider(request.provider_id.as_str())
                    .init(content, content_type);
                if let Some(parent) = source_id {
                    builder = builder.parent(parent);
                }
                builder
            }
        }
        .caused_by(request.trigger.delta_id)
        .build()
        .map_err(|e| DispatchError::Gateway(e.to_string()))?;

        let accepted = self.gateway.submit(delta).await?;
        Ok(DispatchResult::Completed(accepted.id))
    }
}

#[async_trait::async_trait]
impl<G: BlobGateway + 'static> Dispatcher for RegistryDispatcher<G> {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        if request.provider_id.is_user() {
            return DispatchResult::Skipped;
        }
        let Some(provider) = self.registry.get(&request.provider_id) else {
            return DispatchResult::Failed(DispatchError::UnknownProvider(
                request.provider_id.clone(),
            ));
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(provider.as_ref(), &request).await {
                Ok(result) => return result,
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff_for(attempt);
                    if backoff >= request.remaining() {
                        return DispatchResult::Failed(err);
                    }
                    warn!(
                        provider = %request.provider_id,
                        blob = %request.blob_id,
                        attempt,
                        error = %err,
                        "retrying dispatch"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    debug!(
                        provider = %request.provider_id,
                        blob = %request.blob_id,
                        attempt,
                        error = %err,
                        "dispatch failed"
                    );
                    return DispatchResult::Failed(err);
                }
            }
        }
    }
}
