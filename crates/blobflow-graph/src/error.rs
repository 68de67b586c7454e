//! Graph errors

use blobflow_delta::BlobId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// `child` is already an ancestor of `parent`
    #[error("edge {parent} -> {child} would create a cycle")]
    CycleRejected { parent: BlobId, child: BlobId },

    #[error("blob {0} is not in the index")]
    NodeNotFound(BlobId),
}
