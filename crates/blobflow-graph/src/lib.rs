//! Blobflow DAG Index
//!
//! In-memory graph of blob derivation relationships, kept consistent with
//! the delta log by feeding it every accepted delta.
//!
//! - [`DagIndex`]: shared, lock-protected node arena and edge map
//! - [`Subgraph`]: immutable scope snapshot used by cascade runs
//! - [`GraphError::CycleRejected`]: an edge that would make a blob its own ancestor
//!
//! ```rust,ignore
//! let dag = DagIndex::new();
//! dag.add_edge(x, y, ProviderId::new("expander"), "expand")?;
//! assert!(dag.is_ancestor(x, y));
//! assert!(dag.add_edge(y, x, ProviderId::new("expander"), "expand").is_err());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
mod index;

pub use error::GraphError;
pub use index::{DagIndex, DagNode, EdgeMeta, StructuralOutcome, Subgraph};
