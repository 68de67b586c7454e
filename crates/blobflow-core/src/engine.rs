//! Content engine
//!
//! Single entry point tying the delta log, the materializer, the DAG
//! index and the cascade processor together.
//!
//! # Append pipeline
//!
//! 1. shape check
//! 2. per-blob lock, version check against the log head
//! 3. parent existence check
//! 4. dry-run fold of the delta on the current state
//! 5. durable append
//! 6. DAG update, cache refresh, notifications
//!
//! Steps 5 and 6 run under the same per-blob lock, so notifications for
//! one blob come out in version order.

use crate::cache::StateCache;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::notify::{ChangeEvent, ChangeKind, Notifier};
use crate::store::{DeltaStore, MemoryDeltaStore};
use crate::worker::CascadeWorker;
use blobflow_cascade::{
    BlobGateway, CascadeControl, CascadeProcessor, CascadeReport, Dispatcher, GatewayError,
    NodeOutcome, Provider, ProviderLedger, ProviderRegistry, RegistryDispatcher, Trigger,
};
use blobflow_delta::{
    BlobId, BlobState, Delta, DeltaId, DeltaOperation, MaterializeError, Materializer,
    ProviderId, ProviderState, ProviderStatus,
};
use blobflow_graph::{DagIndex, GraphError};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Result of a successful append
#[derive(Debug, Clone, PartialEq)]
pub struct AppendReceipt {
    /// The accepted delta, with its application time set
    pub delta: Delta,
    /// State of the blob after this delta
    pub state: BlobState,
    /// Structural edges the DAG refused; the delta is still logged
    pub rejected_edges: Vec<GraphError>,
}

/// DAG neighbourhood of a blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relationships {
    pub blob_id: BlobId,
    pub parent: Option<BlobId>,
    /// All parents, primary first
    pub parents: Vec<BlobId>,
    /// Direct children in creation order
    pub children: Vec<BlobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descendants: Option<BTreeSet<BlobId>>,
}

/// Counts from rebuilding the DAG out of the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub blobs: usize,
    pub deltas: usize,
    pub rejected_edges: usize,
}

/// State shared by the engine, its dispatcher and its cascade worker
pub(crate) struct EngineShared {
    config: EngineConfig,
    store: Arc<dyn DeltaStore>,
    dag: Arc<DagIndex>,
    cache: StateCache,
    notifier: Notifier,
    ledger: Arc<ProviderLedger>,
    locks: DashMap<BlobId, Arc<Mutex<()>>>,
    /// Cascades in flight, by root
    running: DashMap<BlobId, Vec<CascadeControl>>,
    queue: Option<mpsc::Sender<Trigger>>,
}

impl EngineShared {
    fn lock_for(&self, blob: BlobId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(blob).or_default().value())
    }

    /// Latest state straight from the log, using the cache when it is current
    async fn current_state(&self, blob: BlobId) -> Result<Option<BlobState>, EngineError> {
        let head = self.store.head_version(blob).await?;
        if head == 0 {
            return Ok(None);
        }
        if let Some(cached) = self.cache.get(blob).await {
            if cached.version == head {
                return Ok(Some(cached.as_ref().clone()));
            }
        }

        let chain = self.store.chain(blob).await?;
        let state = match self.cache.get(blob).await {
            Some(cached) => Materializer::resume(cached.as_ref().clone(), &chain)?,
            None => Materializer::materialize(&chain)?,
        };
        self.cache.insert(state.clone()).await;
        Ok(Some(state))
    }

    /// Overlay live provider records from cascades onto a materialized state
    fn overlay(&self, mut state: BlobState) -> BlobState {
        state
            .provider_status
            .extend(self.ledger.for_blob(state.blob_id));
        state
    }

    async fn append(&self, delta: Delta) -> Result<AppendReceipt, EngineError> {
        delta.validate_shape()?;
        let blob = delta.blob_id;
        let lock = self.lock_for(blob);
        let _guard = lock.lock().await;

        let current = self.current_state(blob).await?;
        let head = current.as_ref().map_or(0, |s| s.version);
        if delta.version != head + 1 {
            return Err(EngineError::VersionConflict {
                blob,
                expected: delta.version,
                found: head,
            });
        }

        if let Some(parent) = delta.parent_id {
            let parent_state = self.current_state(parent).await?;
            if !parent_state.is_some_and(|p| !p.is_deleted()) {
                return Err(EngineError::ParentNotFound(parent));
            }
        }

        let history = if delta.operation == DeltaOperation::Revert {
            self.store.chain(blob).await?
        } else {
            Vec::new()
        };
        let next = Materializer::step(current.as_ref(), &delta, &history)
            .map_err(|e| EngineError::Validation(e.to_string()))?;

        let accepted = delta.accept(Utc::now());
        self.store.append(accepted.clone()).await?;

        let structural = self.dag.apply_delta(&accepted);
        if matches!(
            accepted.operation,
            DeltaOperation::Delete | DeltaOperation::Revert
        ) {
            self.dag.set_tombstone(blob, next.deleted_at);
        }
        self.cache.insert(next.clone()).await;

        info!(
            blob = %blob,
            delta = %accepted.id,
            version = accepted.version,
            operation = %accepted.operation,
            provider = %accepted.provider_id,
            "delta accepted"
        );
        self.notifier.publish(ChangeEvent::for_delta(
            ChangeKind::for_operation(accepted.operation),
            &accepted,
        ));
        self.notifier
            .publish(ChangeEvent::for_delta(ChangeKind::DeltaApplied, &accepted));

        for rejection in &structural.rejected {
            warn!(blob = %blob, delta = %accepted.id, error = %rejection, "structure not materialized");
            self.ledger.record(
                blob,
                accepted.provider_id.clone(),
                ProviderState::new(ProviderStatus::Failed, accepted.version)
                    .with_trigger(accepted.id)
                    .with_error(rejection.to_string()),
            );
            self.notifier.publish(
                ChangeEvent::for_delta(ChangeKind::ProcessingFailed, &accepted)
                    .with_error(rejection.to_string()),
            );
        }

        if accepted.operation == DeltaOperation::Delete {
            self.cancel_cascades(blob);
        }
        if self.config.auto_cascade {
            self.enqueue(Trigger::from_delta(&accepted));
        }

        Ok(AppendReceipt {
            delta: accepted,
            state: next,
            rejected_edges: structural.rejected,
        })
    }

    fn cancel_cascades(&self, root: BlobId) {
        if let Some(controls) = self.running.get(&root) {
            for control in controls.iter() {
                control.cancel();
            }
            info!(root = %root, cascades = controls.len(), "cancelled cascades of deleted blob");
        }
    }

    fn enqueue(&self, trigger: Trigger) {
        let Some(queue) = &self.queue else {
            return;
        };
        match queue.try_send(trigger) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(trigger)) => {
                warn!(root = %trigger.root, delta = %trigger.delta_id, "cascade queue full, trigger dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("cascade worker stopped");
            }
        }
    }

    fn publish_report(&self, report: &CascadeReport) {
        for node in &report.nodes {
            let event = match &node.outcome {
                NodeOutcome::Completed(delta) => {
                    ChangeEvent::new(ChangeKind::ProcessingComplete, node.blob_id).with_delta(*delta)
                }
                NodeOutcome::Failed(err) => {
                    ChangeEvent::new(ChangeKind::ProcessingFailed, node.blob_id)
                        .with_delta(report.trigger.delta_id)
                        .with_error(err.to_string())
                }
                NodeOutcome::Skipped(_) => continue,
            };
            let event = match &node.provider_id {
                Some(provider) => event.with_provider(provider.clone()),
                None => event,
            };
            self.notifier.publish(event);
        }
    }
}

#[async_trait::async_trait]
impl BlobGateway for EngineShared {
    async fn load(&self, blob: BlobId) -> Result<Option<BlobState>, GatewayError> {
        Ok(self.current_state(blob).await?)
    }

    fn source_of(&self, blob: BlobId) -> Option<BlobId> {
        self.dag.get_parent(blob)
    }

    async fn submit(&self, delta: Delta) -> Result<Delta, GatewayError> {
        Ok(self.append(delta).await?.delta)
    }
}

/// Runs cascades and reports their outcomes as notifications
#[derive(Clone)]
pub(crate) struct CascadeRunner {
    shared: Arc<EngineShared>,
    processor: Arc<CascadeProcessor>,
}

impl CascadeRunner {
    pub(crate) async fn run(&self, trigger: Trigger) -> CascadeReport {
        let root = trigger.root;
        let control = CascadeControl::new();
        self.shared
            .running
            .entry(root)
            .or_default()
            .push(control.clone());

        let report = self
            .processor
            .run_with_control(trigger, control.clone())
            .await;

        if let Some(mut controls) = self.shared.running.get_mut(&root) {
            controls.retain(|c| !c.same_cascade(&control));
        }
        self.shared.running.remove_if(&root, |_, controls| controls.is_empty());

        self.shared.publish_report(&report);
        report
    }
}

/// Engine facade
pub struct ContentEngine {
    shared: Arc<EngineShared>,
    runner: CascadeRunner,
    registry: Arc<ProviderRegistry>,
    worker: Option<CascadeWorker>,
}

impl ContentEngine {
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// In-memory engine with the given configuration
    ///
    /// # Errors
    /// Returns error if the configuration is invalid
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder().config(config).build()
    }

    /// Append a delta
    ///
    /// # Errors
    /// - [`EngineError::Validation`] for malformed or inapplicable deltas
    /// - [`EngineError::VersionConflict`] if `version` is not head + 1
    /// - [`EngineError::ParentNotFound`] if `parent_id` is missing or deleted
    pub async fn append(&self, delta: Delta) -> Result<AppendReceipt, EngineError> {
        self.shared.append(delta).await
    }

    /// Materialized state, latest or as of `version`
    ///
    /// Latest reads include live provider records from cascades.
    ///
    /// # Errors
    /// Returns error if the blob or version does not exist
    pub async fn get_blob(
        &self,
        blob: BlobId,
        version: Option<u64>,
    ) -> Result<BlobState, EngineError> {
        match version {
            None => {
                let state = self
                    .shared
                    .current_state(blob)
                    .await?
                    .ok_or(EngineError::BlobNotFound(blob))?;
                Ok(self.shared.overlay(state))
            }
            Some(version) => {
                let chain = self.shared.store.chain(blob).await?;
                if chain.is_empty() {
                    return Err(EngineError::BlobNotFound(blob));
                }
                Materializer::materialize_at(&chain, version).map_err(|err| match err {
                    MaterializeError::VersionNotFound { .. } => {
                        EngineError::VersionNotFound { blob, version }
                    }
                    other => EngineError::Materialize(other),
                })
            }
        }
    }

    /// Ordered delta chain, oldest first
    ///
    /// # Errors
    /// Returns [`EngineError::BlobNotFound`] if the blob has no history
    pub async fn history(&self, blob: BlobId) -> Result<Vec<Delta>, EngineError> {
        let chain = self.shared.store.chain(blob).await?;
        if chain.is_empty() {
            return Err(EngineError::BlobNotFound(blob));
        }
        Ok(chain)
    }

    /// # Errors
    /// Returns [`EngineError::DeltaNotFound`] if no such delta was accepted
    pub async fn get_delta(&self, id: DeltaId) -> Result<Delta, EngineError> {
        self.shared
            .store
            .get_delta(id)
            .await?
            .ok_or(EngineError::DeltaNotFound(id))
    }

    /// Parent, children and optionally every descendant of a blob
    ///
    /// # Errors
    /// Returns [`EngineError::BlobNotFound`] if the blob is neither logged nor indexed
    pub async fn relationships(
        &self,
        blob: BlobId,
        include_descendants: bool,
    ) -> Result<Relationships, EngineError> {
        let dag = &self.shared.dag;
        if !dag.contains(blob) && self.shared.store.head_version(blob).await? == 0 {
            return Err(EngineError::BlobNotFound(blob));
        }
        Ok(Relationships {
            blob_id: blob,
            parent: dag.get_parent(blob),
            parents: dag.get_parents(blob),
            children: dag.get_children(blob),
            descendants: include_descendants.then(|| dag.get_descendants(blob)),
        })
    }

    /// Cascade from the latest delta of `blob`
    ///
    /// # Errors
    /// Returns [`EngineError::BlobNotFound`] if the blob has no history
    pub async fn cascade(&self, blob: BlobId) -> Result<CascadeReport, EngineError> {
        let chain = self.shared.store.chain(blob).await?;
        let head = chain.last().ok_or(EngineError::BlobNotFound(blob))?;
        Ok(self.runner.run(Trigger::from_delta(head)).await)
    }

    /// Cascade for a specific accepted delta, e.g. on redelivery
    ///
    /// # Errors
    /// Returns [`EngineError::DeltaNotFound`] if the delta was never accepted
    pub async fn cascade_from(&self, delta: DeltaId) -> Result<CascadeReport, EngineError> {
        let delta = self.get_delta(delta).await?;
        Ok(self.runner.run(Trigger::from_delta(&delta)).await)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.shared.notifier.subscribe()
    }

    /// Processing record of one provider for one blob
    ///
    /// Live cascade records win over what the log implies.
    ///
    /// # Errors
    /// Returns error if the blob's chain cannot be read
    pub async fn provider_state(
        &self,
        blob: BlobId,
        provider: &ProviderId,
    ) -> Result<Option<ProviderState>, EngineError> {
        if let Some(state) = self.shared.ledger.get(blob, provider) {
            return Ok(Some(state));
        }
        Ok(self
            .shared
            .current_state(blob)
            .await?
            .and_then(|s| s.provider_status.get(provider).cloned()))
    }

    /// Rebuild the DAG index from the log, in acceptance order
    ///
    /// # Errors
    /// Returns error if the store cannot be read or a chain no longer folds
    pub async fn rebuild_index(&self) -> Result<RebuildSummary, EngineError> {
        let store = &self.shared.store;
        let blobs = store.blob_ids().await?;

        let mut deltas = Vec::new();
        let mut states = Vec::with_capacity(blobs.len());
        for blob in &blobs {
            let chain = store.chain(*blob).await?;
            states.push(Materializer::materialize(&chain)?);
            deltas.extend(chain);
        }
        deltas.sort_by_key(|d| (d.applied_at, d.id));

        let dag = &self.shared.dag;
        dag.clear();
        let mut summary = RebuildSummary {
            blobs: blobs.len(),
            deltas: deltas.len(),
            rejected_edges: 0,
        };
        for delta in &deltas {
            summary.rejected_edges += dag.apply_delta(delta).rejected.len();
        }

        self.shared.cache.invalidate_all();
        for state in states {
            dag.set_tombstone(state.blob_id, state.deleted_at);
            self.shared.cache.insert(state).await;
        }

        info!(
            blobs = summary.blobs,
            deltas = summary.deltas,
            rejected = summary.rejected_edges,
            "dag index rebuilt"
        );
        Ok(summary)
    }

    pub fn register_provider(&self, id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.registry.register(id, provider);
    }

    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    #[inline]
    #[must_use]
    pub fn dag(&self) -> &Arc<DagIndex> {
        &self.shared.dag
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Stop the background cascade worker, if any
    pub async fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop().await;
        }
    }
}

impl std::fmt::Debug for ContentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentEngine")
            .field("config", &self.shared.config)
            .field("nodes", &self.shared.dag.node_count())
            .field("providers", &self.registry)
            .field("auto_cascade", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ContentEngine`]
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn DeltaStore>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    registry: Arc<ProviderRegistry>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom delta store instead of the in-memory one
    #[must_use]
    pub fn store(mut self, store: Arc<dyn DeltaStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom dispatcher instead of the provider registry
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn provider(self, id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.registry.register(id, provider);
        self
    }

    /// # Errors
    /// Returns [`EngineError::Config`] if the configuration is invalid, or if
    /// `auto_cascade` is set outside a tokio runtime
    pub fn build(self) -> Result<ContentEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let (queue, receiver) = if config.auto_cascade {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(EngineError::Config(
                    "auto_cascade requires a running tokio runtime".into(),
                ));
            }
            let (tx, rx) = mpsc::channel(config.cascade_queue_depth);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let store: Arc<dyn DeltaStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryDeltaStore::new()),
        };
        let shared = Arc::new(EngineShared {
            store,
            dag: Arc::new(DagIndex::new()),
            cache: StateCache::new(config.state_cache_capacity),
            notifier: Notifier::new(config.notification_capacity),
            ledger: Arc::new(ProviderLedger::new()),
            locks: DashMap::new(),
            running: DashMap::new(),
            queue,
            config,
        });

        let registry = self.registry;
        let dispatcher: Arc<dyn Dispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(
                RegistryDispatcher::new(Arc::clone(&registry), Arc::clone(&shared))
                    .with_retry(shared.config.retry.policy()),
            ),
        };
        let processor = Arc::new(CascadeProcessor::new(
            Arc::clone(&shared.dag),
            dispatcher,
            Arc::clone(&shared.ledger),
            shared.config.cascade(),
        ));
        let runner = CascadeRunner {
            shared: Arc::clone(&shared),
            processor,
        };
        let worker = receiver.map(|rx| CascadeWorker::spawn(rx, runner.clone()));

        Ok(ContentEngine {
            shared,
            runner,
            registry,
            worker,
        })
    }
}
