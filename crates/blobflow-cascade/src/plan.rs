//! Level assignment for a cascade
//!
//! A node's level is the length of the longest path from the root to it.
//! Dispatching level by level then guarantees every parent inside the
//! subgraph finishes before any of its children start, including nodes
//! reachable along paths of different lengths.

use blobflow_delta::BlobId;
use blobflow_graph::Subgraph;
use std::collections::{HashMap, VecDeque};

/// Descendants of a root grouped into dispatch levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelPlan {
    pub root: BlobId,
    /// `levels[0]` holds level 1 (direct children of the root)
    pub levels: Vec<Vec<BlobId>>,
    parents: HashMap<BlobId, Vec<BlobId>>,
    depth: HashMap<BlobId, usize>,
}

impl LevelPlan {
    /// Level a snapshot with Kahn's algorithm, relaxing depth to the maximum
    #[must_use]
    pub fn from_subgraph(subgraph: &Subgraph) -> Self {
        let mut out: HashMap<BlobId, Vec<BlobId>> = HashMap::new();
        let mut parents: HashMap<BlobId, Vec<BlobId>> = HashMap::new();
        let mut indegree: HashMap<BlobId, usize> =
            subgraph.nodes.keys().map(|&blob| (blob, 0)).collect();

        for &(parent, child) in &subgraph.edges {
            out.entry(parent).or_default().push(child);
            parents.entry(child).or_default().push(parent);
            *indegree.entry(child).or_insert(0) += 1;
        }

        let mut depth: HashMap<BlobId, usize> = HashMap::new();
        depth.insert(subgraph.root, 0);
        let mut ready = VecDeque::from([subgraph.root]);

        while let Some(node) = ready.pop_front() {
            let base = depth.get(&node).copied().unwrap_or(0);
            for &child in out.get(&node).into_iter().flatten() {
                let entry = depth.entry(child).or_insert(0);
                *entry = (*entry).max(base + 1);
                if let Some(remaining) = indegree.get_mut(&child) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); max_depth];
        for (&blob, &d) in &depth {
            if d > 0 {
                levels[d - 1].push(blob);
            }
        }
        for level in &mut levels {
            level.sort_unstable();
        }
        depth.remove(&subgraph.root);

        Self {
            root: subgraph.root,
            levels,
            parents,
            depth,
        }
    }

    /// 1-based level of a descendant
    #[inline]
    #[must_use]
    pub fn level_of(&self, blob: BlobId) -> Option<usize> {
        self.depth.get(&blob).copied()
    }

    /// Parents of `blob` that are inside this cascade
    #[must_use]
    pub fn parents_of(&self, blob: BlobId) -> &[BlobId] {
        self.parents.get(&blob).map_or(&[], Vec::as_slice)
    }

    /// Number of descendants to dispatch
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.depth.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.depth.is_empty()
    }
}
