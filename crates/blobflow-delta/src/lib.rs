//! Blobflow Delta Model
//!
//! Immutable change records and the pure fold that turns them into state.
//!
//! # Core Concepts
//!
//! - [`Delta`]: atomic, immutable change record targeting one blob
//! - [`Patch`]: operation payload (init, replace, JSON merge)
//! - [`BlobState`]: materialized view of a blob at one version
//! - [`Materializer`]: deterministic fold over an ordered delta chain
//! - [`Fingerprint`]: Blake3 digest of a state's canonical encoding
//!
//! # Example
//!
//! ```rust,ignore
//! use blobflow_delta::{BlobId, Delta, DeltaOperation, Materializer};
//!
//! let blob = BlobId::new();
//! let create = Delta::builder(blob, DeltaOperation::Create)
//!     .user("alice")
//!     .init(json!("draft"), "text/plain")
//!     .build()?;
//!
//! let state = Materializer::materialize(&[create])?;
//! assert_eq!(state.version, 1);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod delta;
mod fingerprint;
mod ids;
mod materialize;
mod state;

pub use delta::{Delta, DeltaBuilder, DeltaError, DeltaOperation, Patch};
pub use fingerprint::{Fingerprint, FingerprintError};
pub use ids::{BlobId, DeltaId, ProviderId, UserId};
pub use materialize::{MaterializeError, Materializer};
pub use state::{BlobState, ProviderState, ProviderStatus};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replay_is_byte_identical() {
        let blob = BlobId::new();
        let create = Delta::builder(blob, DeltaOperation::Create)
            .user("alice")
            .init(json!({"title": "draft"}), "application/json")
            .build()
            .unwrap();
        let transform = Delta::builder(blob, DeltaOperation::Transform)
            .user("alice")
            .provider("expander")
            .merge(json!({"body": "expanded"}))
            .child(BlobId::new())
            .version(2)
            .build()
            .unwrap();
        let chain = vec![create, transform];

        let first = Materializer::materialize(&chain).unwrap();
        let second = Materializer::materialize(&chain).unwrap();
        assert_eq!(
            first.to_canonical_bytes().unwrap(),
            second.to_canonical_bytes().unwrap()
        );
        assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
    }

    #[test]
    fn chain_survives_json_roundtrip() {
        let blob = BlobId::new();
        let create = Delta::builder(blob, DeltaOperation::Create)
            .user("alice")
            .init(json!("draft"), "text/plain")
            .build()
            .unwrap();
        let encoded = serde_json::to_string(&vec![create.clone()]).unwrap();
        let decoded: Vec<Delta> = serde_json::from_str(&encoded).unwrap();

        assert_eq!(
            Materializer::materialize(&decoded).unwrap(),
            Materializer::materialize(&[create]).unwrap()
        );
    }
}
