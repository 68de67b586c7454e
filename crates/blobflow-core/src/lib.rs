//! Blobflow Core
//!
//! The engine that owns the delta log and keeps everything derived from
//! it current.
//!
//! # Architecture
//!
//! ```text
//! append(delta)
//!     │
//!     ▼
//! ┌──────────────┐   dry-run fold   ┌──────────────┐
//! │  DeltaStore  │ ◄─────────────── │ Materializer │
//! └──────┬───────┘                  └──────────────┘
//!        │ accepted
//!        ▼
//! ┌──────────────┐   ┌────────────┐   ┌───────────────┐
//! │   DagIndex   │   │ StateCache │   │   Notifier    │
//! └──────┬───────┘   └────────────┘   └───────────────┘
//!        │ cascade(root)
//!        ▼
//! ┌──────────────────┐   dispatch   ┌────────────────────┐
//! │ CascadeProcessor │ ───────────► │ RegistryDispatcher │ ──► append(delta)
//! └──────────────────┘              └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = ContentEngine::builder()
//!     .provider("expander", Arc::new(Expander))
//!     .build()?;
//!
//! let receipt = engine.append(create).await?;
//! let report = engine.cascade(receipt.delta.blob_id).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod cache;
mod config;
mod engine;
mod error;
pub mod logging;
mod notify;
mod store;
mod worker;

pub use cache::StateCache;
pub use config::{EngineConfig, RetryConfig};
pub use engine::{AppendReceipt, ContentEngine, EngineBuilder, RebuildSummary, Relationships};
pub use error::{ConfigError, EngineError, StoreError};
pub use logging::LogFormat;
pub use notify::{ChangeEvent, ChangeKind, Notifier};
pub use store::{DeltaStore, MemoryDeltaStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
