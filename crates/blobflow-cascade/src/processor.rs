//! Cascade processor
//!
//! Walks the descendants of a changed blob level by level, dispatching
//! every node of a level concurrently and waiting for the whole level
//! before starting the next one.
//!
//! # Phases
//!
//! `Collecting -> Leveling -> (Dispatching(i) -> Awaiting(i))* -> Done`
//!
//! A failed node never aborts its siblings. Whether its descendants still
//! run is decided by [`FailurePolicy`].

use crate::dispatch::{DispatchError, DispatchRequest, DispatchResult, Dispatcher, Trigger};
use crate::ledger::ProviderLedger;
use crate::plan::LevelPlan;
use blobflow_delta::{BlobId, DeltaId, ProviderId, ProviderState, ProviderStatus};
use blobflow_graph::{DagIndex, DagNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

/// What to do with the descendants of a failed node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Dispatch them anyway against the last good upstream state
    #[default]
    Continue,
    /// Skip everything below a failure within this cascade
    SkipDescendants,
}

/// Processor settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeConfig {
    /// Bound on a single dispatch, measured from when it starts running
    pub dispatch_timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Dispatches in flight across all cascades sharing this processor
    pub max_concurrent_dispatches: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::Continue,
            max_concurrent_dispatches: 64,
        }
    }
}

impl CascadeConfig {
    #[must_use]
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_dispatches(mut self, max: usize) -> Self {
        self.max_concurrent_dispatches = max;
        self
    }
}

/// Cooperative cancellation handle for one cascade
///
/// Checked between levels; dispatches already in flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct CascadeControl {
    cancelled: Arc<AtomicBool>,
}

impl CascadeControl {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether two handles control the same cascade
    #[inline]
    #[must_use]
    pub fn same_cascade(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "level", rename_all = "snake_case")]
pub enum CascadePhase {
    Collecting,
    Leveling,
    Dispatching(usize),
    Awaiting(usize),
    Done,
}

/// Terminal state of a cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStatus {
    /// Every dispatched node completed or skipped
    Done,
    /// Finished, but at least one node failed
    Failed,
    /// Stopped between levels before finishing
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Dispatcher had nothing to do
    Declined,
    /// Node has no provider edge
    NoProvider,
    Tombstoned,
    /// An ancestor in this cascade failed
    UpstreamFailed,
    /// Same trigger was already processed for this node
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Completed(DeltaId),
    Skipped(SkipReason),
    Failed(DispatchError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub blob_id: BlobId,
    pub provider_id: Option<ProviderId>,
    pub level: usize,
    pub outcome: NodeOutcome,
}

/// Everything a finished cascade has to say
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeReport {
    pub trigger: Trigger,
    pub levels: Vec<Vec<BlobId>>,
    /// Per-node outcomes in dispatch order
    pub nodes: Vec<NodeReport>,
    pub phases: Vec<CascadePhase>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CascadeReport {
    fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            levels: Vec::new(),
            nodes: Vec::new(),
            phases: Vec::new(),
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    fn enter(&mut self, phase: CascadePhase) {
        debug!(?phase, "cascade phase");
        self.phases.push(phase);
    }

    #[must_use]
    pub fn outcome(&self, blob: BlobId) -> Option<&NodeOutcome> {
        self.nodes
            .iter()
            .find(|n| n.blob_id == blob)
            .map(|n| &n.outcome)
    }

    /// Failed nodes and their errors
    #[must_use]
    pub fn failures(&self) -> Vec<(BlobId, &DispatchError)> {
        self.nodes
            .iter()
            .filter_map(|n| match &n.outcome {
                NodeOutcome::Failed(err) => Some((n.blob_id, err)),
                _ => None,
            })
            .collect()
    }

    #[inline]
    #[must_use]
    pub fn partial_failure(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.outcome, NodeOutcome::Failed(_)))
    }

    #[must_use]
    pub fn completed(&self) -> Vec<(BlobId, DeltaId)> {
        self.nodes
            .iter()
            .filter_map(|n| match n.outcome {
                NodeOutcome::Completed(delta) => Some((n.blob_id, delta)),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn status(&self) -> CascadeStatus {
        if self.cancelled {
            CascadeStatus::Cancelled
        } else if self.partial_failure() {
            CascadeStatus::Failed
        } else {
            CascadeStatus::Done
        }
    }
}

/// Runs cascades over a shared DAG index
pub struct CascadeProcessor {
    dag: Arc<DagIndex>,
    dispatcher: Arc<dyn Dispatcher>,
    ledger: Arc<ProviderLedger>,
    config: CascadeConfig,
    limiter: Arc<Semaphore>,
}

impl CascadeProcessor {
    #[must_use]
    pub fn new(
        dag: Arc<DagIndex>,
        dispatcher: Arc<dyn Dispatcher>,
        ledger: Arc<ProviderLedger>,
        config: CascadeConfig,
    ) -> Self {
        let permits = config.max_concurrent_dispatches.max(1);
        Self {
            dag,
            dispatcher,
            ledger,
            config,
            limiter: Arc::new(Semaphore::new(permits)),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<ProviderLedger> {
        &self.ledger
    }

    /// Run a cascade to completion
    pub async fn run(&self, trigger: Trigger) -> CascadeReport {
        self.run_with_control(trigger, CascadeControl::new()).await
    }

    /// Run a cascade that can be cancelled between levels
    pub async fn run_with_control(
        &self,
        trigger: Trigger,
        control: CascadeControl,
    ) -> CascadeReport {
        let span = info_span!(
            "cascade",
            root = %trigger.root,
            trigger = %trigger.delta_id,
            event = %trigger.event,
        );
        self.execute(trigger, control).instrument(span).await
    }

    async fn execute(&self, trigger: Trigger, control: CascadeControl) -> CascadeReport {
        let started = Instant::now();
        let mut report = CascadeReport::new(trigger.clone());

        report.enter(CascadePhase::Collecting);
        let subgraph = match self.dag.subgraph(trigger.root) {
            Ok(subgraph) => subgraph,
            Err(err) => {
                debug!(error = %err, "root not indexed; nothing to cascade");
                report.enter(CascadePhase::Done);
                report.elapsed = started.elapsed();
                return report;
            }
        };

        report.enter(CascadePhase::Leveling);
        let plan = LevelPlan::from_subgraph(&subgraph);
        report.levels = plan.levels.clone();

        let mut blocked: HashSet<BlobId> = HashSet::new();
        for (index, level) in plan.levels.iter().enumerate() {
            let depth = index + 1;
            if control.is_cancelled() {
                info!(level = depth, "cascade cancelled");
                report.cancelled = true;
                break;
            }

            report.enter(CascadePhase::Dispatching(depth));
            let mut pending = Vec::with_capacity(level.len());
            let mut handles = Vec::with_capacity(level.len());

            for &blob in level {
                let node = subgraph.node(blob);
                let provider = node.and_then(|n| n.provider_id.clone());
                let upstream_failed = self.config.failure_policy
                    == FailurePolicy::SkipDescendants
                    && plan.parents_of(blob).iter().any(|p| blocked.contains(p));
                let skip = match &provider {
                    _ if node.is_some_and(DagNode::is_deleted) => Some(SkipReason::Tombstoned),
                    None => Some(SkipReason::NoProvider),
                    Some(_) if upstream_failed => Some(SkipReason::UpstreamFailed),
                    Some(p) if self.ledger.already_handled(blob, p, trigger.delta_id) => {
                        Some(SkipReason::AlreadyProcessed)
                    }
                    Some(_) => None,
                };

                let provider_id = match (provider, skip) {
                    (Some(provider_id), None) => provider_id,
                    (provider, reason) => {
                        let reason = reason.unwrap_or(SkipReason::NoProvider);
                        if upstream_failed {
                            blocked.insert(blob);
                        }
                        // Not stamped with the trigger: a later run of the
                        // same trigger must still dispatch this node.
                        if let Some(provider_id) = &provider {
                            if reason != SkipReason::AlreadyProcessed {
                                self.ledger.record(
                                    blob,
                                    provider_id.clone(),
                                    ProviderState::new(
                                        ProviderStatus::Skipped,
                                        trigger.root_version,
                                    ),
                                );
                            }
                        }
                        report.nodes.push(NodeReport {
                            blob_id: blob,
                            provider_id: provider,
                            level: depth,
                            outcome: NodeOutcome::Skipped(reason),
                        });
                        continue;
                    }
                };

                self.ledger.record(
                    blob,
                    provider_id.clone(),
                    ProviderState::new(ProviderStatus::Processing, trigger.root_version)
                        .with_trigger(trigger.delta_id),
                );

                let dispatcher = Arc::clone(&self.dispatcher);
                let limiter = Arc::clone(&self.limiter);
                let timeout = self.config.dispatch_timeout;
                let request_provider = provider_id.clone();
                let request_trigger = trigger.clone();
                handles.push(tokio::spawn(
                    async move {
                        let Ok(_permit) = limiter.acquire_owned().await else {
                            return DispatchResult::Failed(DispatchError::Cancelled);
                        };
                        let request = DispatchRequest {
                            provider_id: request_provider,
                            blob_id: blob,
                            trigger: request_trigger,
                            deadline: deadline_after(timeout),
                        };
                        match tokio::time::timeout(timeout, dispatcher.dispatch(request)).await {
                            Ok(result) => result,
                            Err(_) => DispatchResult::Failed(DispatchError::Timeout(timeout)),
                        }
                    }
                    .in_current_span(),
                ));
                pending.push((blob, provider_id));
            }

            report.enter(CascadePhase::Awaiting(depth));
            let joined = futures::future::join_all(handles).await;

            for ((blob, provider_id), joined) in pending.into_iter().zip(joined) {
                let result = joined.unwrap_or_else(|err| {
                    DispatchResult::Failed(DispatchError::Panicked(err.to_string()))
                });
                let base = ProviderState::new(ProviderStatus::Completed, trigger.root_version)
                    .with_trigger(trigger.delta_id);
                let (state, outcome) = match result {
                    DispatchResult::Completed(delta) => (base, NodeOutcome::Completed(delta)),
                    DispatchResult::Skipped => (
                        ProviderState {
                            status: ProviderStatus::Skipped,
                            ..base
                        },
                        NodeOutcome::Skipped(SkipReason::Declined),
                    ),
                    DispatchResult::Failed(err) => {
                        warn!(blob = %blob, provider = %provider_id, error = %err, "dispatch failed");
                        blocked.insert(blob);
                        (
                            ProviderState {
                                status: ProviderStatus::Failed,
                                ..base
                            }
                            .with_error(err.to_string()),
                            NodeOutcome::Failed(err),
                        )
                    }
                };
                self.ledger.record(blob, provider_id.clone(), state);
                report.nodes.push(NodeReport {
                    blob_id: blob,
                    provider_id: Some(provider_id),
                    level: depth,
                    outcome,
                });
            }
            debug!(level = depth, nodes = level.len(), "level settled");
        }

        report.enter(CascadePhase::Done);
        report.elapsed = started.elapsed();
        info!(
            descendants = plan.len(),
            levels = report.levels.len(),
            failed = report.failures().len(),
            cancelled = report.cancelled,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "cascade finished"
        );
        report
    }
}

/// Wall-clock deadline for a dispatch whose timeout starts now
fn deadline_after(timeout: Duration) -> DateTime<Utc> {
    Utc::now()
        + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(1))
}

impl std::fmt::Debug for CascadeProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeProcessor")
            .field("config", &self.config)
            .field("available_permits", &self.limiter.available_permits())
            .finish_non_exhaustive()
    }
}
