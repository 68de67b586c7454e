//! DAG index
//!
//! Arena-style storage (blob id -> node record) plus a `petgraph` edge map,
//! both behind one `RwLock` so readers never observe half of an edge
//! insertion. Only ids and owned snapshots leave this module.

use crate::error::GraphError;
use blobflow_delta::{BlobId, Delta, DeltaId, ProviderId, UserId};
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Provenance of a derivation edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeMeta {
    pub provider_id: ProviderId,
    /// Name of the transform that produced the edge
    pub transform: String,
    /// Structural delta that declared the edge, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_id: Option<DeltaId>,
}

/// Node record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub blob_id: BlobId,
    pub user_id: Option<UserId>,
    /// Provider that derives this blob; dispatched when an ancestor changes
    pub provider_id: Option<ProviderId>,
    /// Primary parent (first edge into this node)
    pub parent: Option<BlobId>,
    /// Children in creation order
    pub children: IndexSet<BlobId>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DagNode {
    fn new(blob_id: BlobId) -> Self {
        Self {
            blob_id,
            user_id: None,
            provider_id: None,
            parent: None,
            children: IndexSet::new(),
            deleted_at: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Result of feeding one delta's structural fields to the index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuralOutcome {
    /// The delta id had been applied before; nothing changed
    pub duplicate: bool,
    /// Edges inserted by this call
    pub added: Vec<(BlobId, BlobId)>,
    /// Edges refused because they would close a cycle
    pub rejected: Vec<GraphError>,
}

/// Immutable copy of a root and everything reachable from it
///
/// A cascade runs on this snapshot; edges added later do not join the run.
#[derive(Debug, Clone, PartialEq)]
pub struct Subgraph {
    pub root: BlobId,
    /// Root first, then descendants in discovery order
    pub nodes: IndexMap<BlobId, DagNode>,
    /// Edges whose endpoints are both in `nodes`
    pub edges: Vec<(BlobId, BlobId)>,
}

impl Subgraph {
    #[must_use]
    pub fn node(&self, blob: BlobId) -> Option<&DagNode> {
        self.nodes.get(&blob)
    }

    /// Descendant count (root excluded)
    #[inline]
    #[must_use]
    pub fn descendant_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }
}

#[derive(Debug, Default)]
struct Inner {
    graph: DiGraphMap<BlobId, EdgeMeta>,
    nodes: HashMap<BlobId, DagNode>,
    applied: HashSet<DeltaId>,
}

impl Inner {
    fn node_mut(&mut self, blob: BlobId) -> &mut DagNode {
        self.graph.add_node(blob);
        self.nodes.entry(blob).or_insert_with(|| DagNode::new(blob))
    }

    fn reaches(&self, from: BlobId, to: BlobId) -> bool {
        self.graph.contains_node(from)
            && self.graph.contains_node(to)
            && petgraph::algo::has_path_connecting(&self.graph, from, to, None)
    }

    fn insert_edge(
        &mut self,
        parent: BlobId,
        child: BlobId,
        meta: EdgeMeta,
    ) -> Result<bool, GraphError> {
        if parent == child || self.reaches(child, parent) {
            return Err(GraphError::CycleRejected { parent, child });
        }
        if self.graph.contains_edge(parent, child) {
            return Ok(false);
        }

        let provider = meta.provider_id.clone();
        self.node_mut(parent).children.insert(child);
        let node = self.node_mut(child);
        node.parent.get_or_insert(parent);
        node.provider_id.get_or_insert(provider);
        self.graph.add_edge(parent, child, meta);
        Ok(true)
    }
}

/// Shared, read-heavy index of derivation edges
#[derive(Debug, Default)]
pub struct DagIndex {
    inner: RwLock<Inner>,
}

impl DagIndex {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `parent -> child`
    ///
    /// Returns `true` if the edge is new, `false` if it already existed.
    ///
    /// # Errors
    /// Returns [`GraphError::CycleRejected`] if `child` is already an
    /// ancestor of `parent` (or they are the same blob); the graph is unchanged
    pub fn add_edge(
        &self,
        parent: BlobId,
        child: BlobId,
        provider: ProviderId,
        transform: impl Into<String>,
    ) -> Result<bool, GraphError> {
        let meta = EdgeMeta {
            provider_id: provider,
            transform: transform.into(),
            delta_id: None,
        };
        let result = self.inner.write().insert_edge(parent, child, meta);
        if let Err(err) = &result {
            tracing::warn!(%parent, %child, "edge rejected: {err}");
        }
        result
    }

    /// Apply the structural fields of an accepted delta
    ///
    /// Structural deltas are keyed by id, so a redelivered one is a no-op.
    /// Deltas without structure are not remembered. Cycle-closing edges are
    /// reported in the outcome, never inserted.
    pub fn apply_delta(&self, delta: &Delta) -> StructuralOutcome {
        let mut inner = self.inner.write();
        if delta.has_structure() && !inner.applied.insert(delta.id) {
            return StructuralOutcome {
                duplicate: true,
                ..StructuralOutcome::default()
            };
        }

        let node = inner.node_mut(delta.blob_id);
        node.user_id.get_or_insert_with(|| delta.user_id.clone());

        let mut wanted = Vec::with_capacity(delta.child_ids.len() + 1);
        if let Some(parent) = delta.parent_id {
            wanted.push((parent, delta.blob_id));
        }
        wanted.extend(delta.child_ids.iter().map(|child| (delta.blob_id, *child)));

        let mut outcome = StructuralOutcome::default();
        for (parent, child) in wanted {
            let meta = EdgeMeta {
                provider_id: delta.provider_id.clone(),
                transform: delta.operation.as_str().to_string(),
                delta_id: Some(delta.id),
            };
            match inner.insert_edge(parent, child, meta) {
                Ok(true) => outcome.added.push((parent, child)),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(delta = %delta.id, %parent, %child, "structural edge rejected");
                    outcome.rejected.push(err);
                }
            }
        }
        outcome
    }

    /// Whether a delta's structure has already been applied
    #[must_use]
    pub fn has_applied(&self, delta: DeltaId) -> bool {
        self.inner.read().applied.contains(&delta)
    }

    /// Set or clear the tombstone of a node
    pub fn set_tombstone(&self, blob: BlobId, at: Option<DateTime<Utc>>) {
        self.inner.write().node_mut(blob).deleted_at = at;
    }

    /// Direct children in creation order
    #[must_use]
    pub fn get_children(&self, blob: BlobId) -> Vec<BlobId> {
        self.inner
            .read()
            .nodes
            .get(&blob)
            .map(|n| n.children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All parents (primary parent first)
    #[must_use]
    pub fn get_parents(&self, blob: BlobId) -> Vec<BlobId> {
        let inner = self.inner.read();
        if !inner.graph.contains_node(blob) {
            return Vec::new();
        }
        let primary = inner.nodes.get(&blob).and_then(|n| n.parent);
        let mut parents: Vec<BlobId> = primary.into_iter().collect();
        parents.extend(
            inner
                .graph
                .neighbors_directed(blob, Direction::Incoming)
                .filter(|p| Some(*p) != primary),
        );
        parents
    }

    /// Primary parent
    #[must_use]
    pub fn get_parent(&self, blob: BlobId) -> Option<BlobId> {
        self.inner.read().nodes.get(&blob).and_then(|n| n.parent)
    }

    /// Transitive closure below `blob` (excluding `blob`)
    #[must_use]
    pub fn get_descendants(&self, blob: BlobId) -> BTreeSet<BlobId> {
        let inner = self.inner.read();
        let mut out = BTreeSet::new();
        if !inner.graph.contains_node(blob) {
            return out;
        }
        let mut dfs = Dfs::new(&inner.graph, blob);
        while let Some(node) = dfs.next(&inner.graph) {
            if node != blob {
                out.insert(node);
            }
        }
        out
    }

    /// Whether `a` is a proper ancestor of `b`
    #[must_use]
    pub fn is_ancestor(&self, a: BlobId, b: BlobId) -> bool {
        a != b && self.inner.read().reaches(a, b)
    }

    /// Snapshot of one node
    #[must_use]
    pub fn node(&self, blob: BlobId) -> Option<DagNode> {
        self.inner.read().nodes.get(&blob).cloned()
    }

    #[must_use]
    pub fn contains(&self, blob: BlobId) -> bool {
        self.inner.read().nodes.contains_key(&blob)
    }

    /// Provenance of `parent -> child`
    #[must_use]
    pub fn edge(&self, parent: BlobId, child: BlobId) -> Option<EdgeMeta> {
        self.inner.read().graph.edge_weight(parent, child).cloned()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.inner.read().graph.edge_count()
    }

    /// Consistent snapshot of `root` and its descendants
    ///
    /// # Errors
    /// Returns [`GraphError::NodeNotFound`] if `root` is not indexed
    pub fn subgraph(&self, root: BlobId) -> Result<Subgraph, GraphError> {
        let inner = self.inner.read();
        let root_node = inner
            .nodes
            .get(&root)
            .cloned()
            .ok_or(GraphError::NodeNotFound(root))?;

        let mut members = vec![root];
        let mut dfs = Dfs::new(&inner.graph, root);
        while let Some(node) = dfs.next(&inner.graph) {
            if node != root {
                members.push(node);
            }
        }
        let in_scope: HashSet<BlobId> = members.iter().copied().collect();

        let mut nodes = IndexMap::with_capacity(members.len());
        nodes.insert(root, root_node);
        nodes.extend(
            members[1..]
                .iter()
                .filter_map(|id| inner.nodes.get(id).map(|n| (*id, n.clone()))),
        );
        let edges = inner
            .graph
            .all_edges()
            .filter(|(p, c, _)| in_scope.contains(p) && in_scope.contains(c))
            .map(|(p, c, _)| (p, c))
            .collect();

        Ok(Subgraph { root, nodes, edges })
    }

    /// Drop everything; used before rebuilding from the log
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}
