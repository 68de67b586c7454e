//! Deterministic fold of a delta chain into [`BlobState`]
//!
//! Materialization is all-or-nothing: the first delta that violates the
//! chain contract aborts the fold and is named in the error. The same
//! ordered chain always produces byte-identical state.

use crate::delta::{Delta, DeltaError, DeltaOperation, Patch};
use crate::ids::{BlobId, DeltaId};
use crate::state::{BlobState, ProviderState, ProviderStatus};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Pure folding functions over delta chains
#[derive(Debug, Clone, Copy, Default)]
pub struct Materializer;

impl Materializer {
    /// Fold a whole chain, oldest first
    ///
    /// # Errors
    /// Returns [`MaterializeError::EmptyChain`] for an empty chain, otherwise
    /// the first contract violation with its delta id
    pub fn materialize(chain: &[Delta]) -> Result<BlobState, MaterializeError> {
        Self::fold(chain, None, 0, chain.len())?.ok_or(MaterializeError::EmptyChain)
    }

    /// Fold the chain up to and including `version`
    ///
    /// # Errors
    /// Returns [`MaterializeError::VersionNotFound`] if the chain never reached `version`
    pub fn materialize_at(chain: &[Delta], version: u64) -> Result<BlobState, MaterializeError> {
        let head = chain.len() as u64;
        if version == 0 || version > head {
            return Err(MaterializeError::VersionNotFound { version, head });
        }
        let until = usize::try_from(version)
            .map_err(|_| MaterializeError::VersionNotFound { version, head })?;
        Self::fold(chain, None, 0, until)?.ok_or(MaterializeError::EmptyChain)
    }

    /// Continue folding from a previously materialized state
    ///
    /// The cached state is only trusted if the chain still holds its head
    /// delta at the same position; otherwise the chain is replayed from
    /// the start.
    ///
    /// # Errors
    /// Same as [`Materializer::materialize`]
    pub fn resume(base: BlobState, chain: &[Delta]) -> Result<BlobState, MaterializeError> {
        let resumable = usize::try_from(base.version)
            .ok()
            .filter(|&n| n >= 1 && n <= chain.len())
            .filter(|&n| chain[n - 1].id == base.head && chain[n - 1].blob_id == base.blob_id);

        match resumable {
            Some(n) => Self::fold(chain, Some(base), n, chain.len())?
                .ok_or(MaterializeError::EmptyChain),
            None => Self::materialize(chain),
        }
    }

    /// Apply one delta on top of `state`
    ///
    /// `history` is the chain preceding `delta` and is only consulted for
    /// reverts.
    ///
    /// # Errors
    /// Returns error if the delta cannot follow `state`
    pub fn step(
        state: Option<&BlobState>,
        delta: &Delta,
        history: &[Delta],
    ) -> Result<BlobState, MaterializeError> {
        delta
            .validate_shape()
            .map_err(|source| MaterializeError::Malformed {
                delta_id: delta.id,
                source,
            })?;

        let expected = state.map_or(1, |s| s.version + 1);
        if delta.version != expected {
            return Err(MaterializeError::VersionGap {
                delta_id: delta.id,
                expected,
                found: delta.version,
            });
        }
        if let Some(s) = state {
            if s.blob_id != delta.blob_id {
                return Err(MaterializeError::ForeignDelta {
                    delta_id: delta.id,
                    expected: s.blob_id,
                    found: delta.blob_id,
                });
            }
        }

        let mut next = match (delta.operation, state) {
            (DeltaOperation::Create, None) => Self::create(delta)?,
            (DeltaOperation::Create, Some(_)) => {
                return Err(MaterializeError::AlreadyCreated { delta_id: delta.id })
            }
            (_, None) => return Err(MaterializeError::NotCreated { delta_id: delta.id }),
            (DeltaOperation::Revert, Some(s)) => Self::revert(s, delta, history)?,
            (_, Some(s)) if s.is_deleted() => {
                return Err(MaterializeError::Tombstoned { delta_id: delta.id })
            }
            (DeltaOperation::Update | DeltaOperation::Transform, Some(s)) => {
                let mut next = s.clone();
                Self::apply_patch(&mut next.content, &delta.patch).map_err(|reason| {
                    MaterializeError::PatchInapplicable {
                        delta_id: delta.id,
                        reason,
                    }
                })?;
                next
            }
            (DeltaOperation::Delete, Some(s)) => {
                let mut next = s.clone();
                next.deleted_at = Some(delta.created_at);
                next
            }
        };

        if next.parent_id.is_none() {
            next.parent_id = delta.parent_id;
        }
        for child in &delta.child_ids {
            next.push_child(*child);
        }
        if !delta.provider_id.is_user() {
            next.provider_status.insert(
                delta.provider_id.clone(),
                ProviderState::new(ProviderStatus::Completed, delta.version),
            );
        }
        next.version = delta.version;
        next.head = delta.id;
        next.updated_at = delta.created_at;
        Ok(next)
    }

    fn fold(
        chain: &[Delta],
        start: Option<BlobState>,
        from: usize,
        until: usize,
    ) -> Result<Option<BlobState>, MaterializeError> {
        let mut state = start;
        for idx in from..until {
            state = Some(Self::step(state.as_ref(), &chain[idx], &chain[..idx])?);
        }
        Ok(state)
    }

    fn create(delta: &Delta) -> Result<BlobState, MaterializeError> {
        let Patch::Init {
            content,
            content_type,
        } = &delta.patch
        else {
            return Err(MaterializeError::PatchInapplicable {
                delta_id: delta.id,
                reason: "create requires an init patch".to_string(),
            });
        };
        Ok(BlobState {
            blob_id: delta.blob_id,
            user_id: delta.user_id.clone(),
            content: content.clone(),
            content_type: content_type.clone(),
            version: delta.version,
            head: delta.id,
            parent_id: delta.parent_id,
            child_ids: Vec::new(),
            provider_status: BTreeMap::new(),
            deleted_at: None,
            created_at: delta.created_at,
            updated_at: delta.created_at,
        })
    }

    fn revert(
        current: &BlobState,
        delta: &Delta,
        history: &[Delta],
    ) -> Result<BlobState, MaterializeError> {
        let target = delta.caused_by.ok_or(MaterializeError::Malformed {
            delta_id: delta.id,
            source: DeltaError::MissingField("caused_by"),
        })?;
        let idx = history
            .iter()
            .position(|d| d.id == target)
            .ok_or(MaterializeError::RevertTargetMissing {
                delta_id: delta.id,
                target,
            })?;
        let restored = Self::fold(history, None, 0, idx + 1)?
            .ok_or(MaterializeError::RevertTargetMissing {
                delta_id: delta.id,
                target,
            })?;

        // structural pointers are never retracted
        let mut next = current.clone();
        next.content = restored.content;
        next.content_type = restored.content_type;
        next.deleted_at = restored.deleted_at;
        Ok(next)
    }

    fn apply_patch(content: &mut Value, patch: &Patch) -> Result<(), String> {
        match patch {
            Patch::Replace { content: replacement } => {
                *content = replacement.clone();
                Ok(())
            }
            Patch::Merge { diff } => {
                let Value::Object(diff) = diff else {
                    return Err("merge diff must be a JSON object".to_string());
                };
                let Value::Object(target) = content else {
                    return Err("merge diff requires object content".to_string());
                };
                merge_into(target, diff);
                Ok(())
            }
            Patch::Init { .. } | Patch::None => Err("patch carries no content change".to_string()),
        }
    }
}

/// JSON merge-patch over an object
fn merge_into(target: &mut Map<String, Value>, diff: &Map<String, Value>) {
    for (key, value) in diff {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(nested) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(slot) = slot {
                    merge_into(slot, nested);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Chain contract violations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MaterializeError {
    #[error("delta chain is empty")]
    EmptyChain,

    #[error("version {version} not found (head is {head})")]
    VersionNotFound { version: u64, head: u64 },

    #[error("delta {delta_id} is malformed: {source}")]
    Malformed {
        delta_id: DeltaId,
        #[source]
        source: DeltaError,
    },

    #[error("delta {delta_id}: expected version {expected}, found {found}")]
    VersionGap {
        delta_id: DeltaId,
        expected: u64,
        found: u64,
    },

    #[error("delta {delta_id} targets {found}, chain belongs to {expected}")]
    ForeignDelta {
        delta_id: DeltaId,
        expected: BlobId,
        found: BlobId,
    },

    #[error("delta {delta_id} creates a blob that already exists")]
    AlreadyCreated { delta_id: DeltaId },

    #[error("delta {delta_id} applies to a blob that was never created")]
    NotCreated { delta_id: DeltaId },

    #[error("delta {delta_id} applies to a deleted blob")]
    Tombstoned { delta_id: DeltaId },

    #[error("delta {delta_id}: patch inapplicable: {reason}")]
    PatchInapplicable { delta_id: DeltaId, reason: String },

    #[error("delta {delta_id} reverts to unknown delta {target}")]
    RevertTargetMissing { delta_id: DeltaId, target: DeltaId },
}

impl MaterializeError {
    /// Offending delta, if the error is tied to one
    #[must_use]
    pub fn delta_id(&self) -> Option<DeltaId> {
        match self {
            Self::EmptyChain | Self::VersionNotFound { .. } => None,
            Self::Malformed { delta_id, .. }
            | Self::VersionGap { delta_id, .. }
            | Self::ForeignDelta { delta_id, .. }
            | Self::AlreadyCreated { delta_id }
            | Self::NotCreated { delta_id }
            | Self::Tombstoned { delta_id }
            | Self::PatchInapplicable { delta_id, .. }
            | Self::RevertTargetMissing { delta_id, .. } => Some(*delta_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn create(blob: BlobId, content: Value) -> Delta {
        Delta::builder(blob, DeltaOperation::Create)
            .user("alice")
            .init(content, "application/json")
            .created_at(at(0))
            .build()
            .unwrap()
    }

    fn next(blob: BlobId, op: DeltaOperation, version: u64) -> crate::DeltaBuilder {
        Delta::builder(blob, op)
            .user("alice")
            .version(version)
            .created_at(at(version as i64))
    }

    #[test]
    fn create_then_replace() {
        let blob = BlobId::new();
        let chain = vec![
            create(blob, json!("draft")),
            next(blob, DeltaOperation::Update, 2)
                .replace(json!("final"))
                .build()
                .unwrap(),
        ];

        let state = Materializer::materialize(&chain).unwrap();
        assert_eq!(state.content, json!("final"));
        assert_eq!(state.version, 2);
        assert_eq!(state.head, chain[1].id);
        assert_eq!(state.created_at, at(0));
        assert_eq!(state.updated_at, at(2));
    }

    #[test]
    fn merge_patch_nested_and_removal() {
        let blob = BlobId::new();
        let chain = vec![
            create(blob, json!({"title": "a", "meta": {"tags": ["x"], "lang": "en"}})),
            next(blob, DeltaOperation::Update, 2)
                .merge(json!({"meta": {"lang": null, "words": 3}, "body": "hi"}))
                .build()
                .unwrap(),
        ];

        let state = Materializer::materialize(&chain).unwrap();
        assert_eq!(
            state.content,
            json!({"title": "a", "body": "hi", "meta": {"tags": ["x"], "words": 3}})
        );
    }

    #[test]
    fn merge_on_scalar_content_fails_with_delta_id() {
        let blob = BlobId::new();
        let update = next(blob, DeltaOperation::Update, 2)
            .merge(json!({"a": 1}))
            .build()
            .unwrap();
        let chain = vec![create(blob, json!("plain")), update.clone()];

        let err = Materializer::materialize(&chain).unwrap_err();
        assert!(matches!(err, MaterializeError::PatchInapplicable { .. }));
        assert_eq!(err.delta_id(), Some(update.id));
    }

    #[test]
    fn transform_records_children_on_target() {
        let blob = BlobId::new();
        let (c1, c2) = (BlobId::new(), BlobId::new());
        let chain = vec![
            create(blob, json!("seed")),
            next(blob, DeltaOperation::Transform, 2)
                .provider("expander")
                .replace(json!("seed+"))
                .child(c1)
                .child(c2)
                .build()
                .unwrap(),
        ];

        let state = Materializer::materialize(&chain).unwrap();
        assert_eq!(state.child_ids, vec![c1, c2]);
        let status = &state.provider_status[&crate::ProviderId::new("expander")];
        assert_eq!(status.status, ProviderStatus::Completed);
        assert_eq!(status.last_processed_version, 2);
    }

    #[test]
    fn update_after_delete_is_rejected() {
        let blob = BlobId::new();
        let update = next(blob, DeltaOperation::Update, 3)
            .replace(json!("zombie"))
            .build()
            .unwrap();
        let chain = vec![
            create(blob, json!("x")),
            next(blob, DeltaOperation::Delete, 2).build().unwrap(),
            update.clone(),
        ];

        let err = Materializer::materialize(&chain).unwrap_err();
        assert_eq!(err, MaterializeError::Tombstoned { delta_id: update.id });
    }

    #[test]
    fn revert_restores_older_content_at_higher_version() {
        let blob = BlobId::new();
        let first = create(blob, json!("v1"));
        let chain = vec![
            first.clone(),
            next(blob, DeltaOperation::Update, 2)
                .replace(json!("v2"))
                .build()
                .unwrap(),
            next(blob, DeltaOperation::Revert, 3)
                .caused_by(first.id)
                .build()
                .unwrap(),
        ];

        let state = Materializer::materialize(&chain).unwrap();
        assert_eq!(state.content, json!("v1"));
        assert_eq!(state.version, 3);
    }

    #[test]
    fn revert_lifts_tombstone() {
        let blob = BlobId::new();
        let first = create(blob, json!("v1"));
        let chain = vec![
            first.clone(),
            next(blob, DeltaOperation::Delete, 2).build().unwrap(),
            next(blob, DeltaOperation::Revert, 3)
                .caused_by(first.id)
                .build()
                .unwrap(),
            next(blob, DeltaOperation::Update, 4)
                .replace(json!("back"))
                .build()
                .unwrap(),
        ];

        let state = Materializer::materialize(&chain).unwrap();
        assert!(!state.is_deleted());
        assert_eq!(state.content, json!("back"));
    }

    #[test]
    fn revert_to_unknown_delta() {
        let blob = BlobId::new();
        let revert = next(blob, DeltaOperation::Revert, 2)
            .caused_by(DeltaId::new())
            .build()
            .unwrap();
        let chain = vec![create(blob, json!("v1")), revert.clone()];

        let err = Materializer::materialize(&chain).unwrap_err();
        assert!(matches!(err, MaterializeError::RevertTargetMissing { delta_id, .. } if delta_id == revert.id));
    }

    #[test]
    fn version_gap_detected() {
        let blob = BlobId::new();
        let chain = vec![
            create(blob, json!("x")),
            next(blob, DeltaOperation::Update, 3)
                .replace(json!("y"))
                .build()
                .unwrap(),
        ];
        let err = Materializer::materialize(&chain).unwrap_err();
        assert!(matches!(err, MaterializeError::VersionGap { expected: 2, found: 3, .. }));
    }

    #[test]
    fn second_create_rejected() {
        let blob = BlobId::new();
        let mut again = create(blob, json!("y"));
        again.version = 2;
        let chain = vec![create(blob, json!("x")), again];
        let err = Materializer::materialize(&chain).unwrap_err();
        assert!(matches!(
            err,
            MaterializeError::Malformed { source: DeltaError::InvalidVersion, .. }
        ));
    }

    #[test]
    fn foreign_delta_rejected() {
        let blob = BlobId::new();
        let other = next(BlobId::new(), DeltaOperation::Update, 2)
            .replace(json!("y"))
            .build()
            .unwrap();
        let chain = vec![create(blob, json!("x")), other];
        let err = Materializer::materialize(&chain).unwrap_err();
        assert!(matches!(err, MaterializeError::ForeignDelta { .. }));
    }

    #[test]
    fn empty_chain() {
        assert_eq!(
            Materializer::materialize(&[]).unwrap_err(),
            MaterializeError::EmptyChain
        );
    }

    #[test]
    fn materialize_at_reads_history() {
        let blob = BlobId::new();
        let chain = vec![
            create(blob, json!("v1")),
            next(blob, DeltaOperation::Update, 2)
                .replace(json!("v2"))
                .build()
                .unwrap(),
        ];

        assert_eq!(Materializer::materialize_at(&chain, 1).unwrap().content, json!("v1"));
        assert_eq!(Materializer::materialize_at(&chain, 2).unwrap().content, json!("v2"));
        assert_eq!(
            Materializer::materialize_at(&chain, 3).unwrap_err(),
            MaterializeError::VersionNotFound { version: 3, head: 2 }
        );
    }

    #[test]
    fn resume_matches_full_replay() {
        let blob = BlobId::new();
        let mut chain = vec![create(blob, json!({"n": 0}))];
        for v in 2..=6 {
            chain.push(
                next(blob, DeltaOperation::Update, v)
                    .merge(json!({"n": v}))
                    .build()
                    .unwrap(),
            );
        }

        let cached = Materializer::materialize_at(&chain, 3).unwrap();
        let resumed = Materializer::resume(cached, &chain).unwrap();
        assert_eq!(resumed, Materializer::materialize(&chain).unwrap());
    }

    #[test]
    fn resume_replays_when_cache_is_foreign() {
        let blob = BlobId::new();
        let chain = vec![create(blob, json!("x"))];
        let mut bogus = Materializer::materialize(&chain).unwrap();
        bogus.head = DeltaId::new();
        bogus.content = json!("poisoned");

        let resumed = Materializer::resume(bogus, &chain).unwrap();
        assert_eq!(resumed.content, json!("x"));
    }

    #[test]
    fn step_is_a_dry_run() {
        let blob = BlobId::new();
        let chain = vec![create(blob, json!("x"))];
        let state = Materializer::materialize(&chain).unwrap();
        let bad = next(blob, DeltaOperation::Update, 2)
            .merge(json!({"k": 1}))
            .build()
            .unwrap();

        assert!(Materializer::step(Some(&state), &bad, &chain).is_err());
        assert_eq!(state.version, 1);
    }
}
