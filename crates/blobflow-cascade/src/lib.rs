//! Blobflow Cascade
//!
//! Propagates a change through the derivation DAG. When a blob changes,
//! every descendant is dispatched to the provider that owns its incoming
//! edge, one level at a time, so a node only runs once everything above
//! it in the same cascade has settled.
//!
//! # Core Concepts
//!
//! - [`LevelPlan`]: longest-path leveling of a DAG snapshot
//! - [`CascadeProcessor`]: level-by-level fan-out with timeout and cancellation
//! - [`Dispatcher`]: the boundary to whatever actually runs providers
//! - [`RegistryDispatcher`]: a dispatcher backed by a [`ProviderRegistry`]
//! - [`ProviderLedger`]: last processing record per (blob, provider)
//!
//! # Example
//!
//! ```rust,ignore
//! let processor = CascadeProcessor::new(dag, dispatcher, ledger, CascadeConfig::default());
//! let report = processor.run(Trigger::from_delta(&accepted)).await;
//! for (blob, err) in report.failures() {
//!     eprintln!("{blob}: {err}");
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod dispatch;
mod ledger;
mod plan;
mod processor;
mod provider;

pub use dispatch::{
    DispatchError, DispatchRequest, DispatchResult, Dispatcher, Trigger, TriggerEvent,
};
pub use ledger::ProviderLedger;
pub use plan::LevelPlan;
pub use processor::{
    CascadeConfig, CascadeControl, CascadePhase, CascadeProcessor, CascadeReport, CascadeStatus,
    FailurePolicy, NodeOutcome, NodeReport, SkipReason,
};
pub use provider::{
    BlobGateway, GatewayError, Provider, ProviderError, ProviderOutput, ProviderRegistry,
    RegistryDispatcher, RetryPolicy, TransformInput,
};
