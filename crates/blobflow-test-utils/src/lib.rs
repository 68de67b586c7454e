//! Testing utilities for the Blobflow workspace
//!
//! Shared delta fixtures, a scripted provider, and a recording dispatcher.

#![allow(missing_docs)]

use blobflow_cascade::{
    DispatchError, DispatchRequest, DispatchResult, Dispatcher, Provider, ProviderError,
    ProviderOutput, TransformInput,
};
use blobflow_delta::{BlobId, Delta, DeltaId, DeltaOperation};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_USER: &str = "alice";

pub fn create_delta(blob: BlobId, content: Value) -> Delta {
    Delta::builder(blob, DeltaOperation::Create)
        .user(TEST_USER)
        .init(content, "application/json")
        .build()
        .unwrap()
}

pub fn create_child_delta(blob: BlobId, parent: BlobId, content: Value) -> Delta {
    Delta::builder(blob, DeltaOperation::Create)
        .user(TEST_USER)
        .init(content, "application/json")
        .parent(parent)
        .build()
        .unwrap()
}

pub fn update_delta(blob: BlobId, version: u64, content: Value) -> Delta {
    Delta::builder(blob, DeltaOperation::Update)
        .user(TEST_USER)
        .replace(content)
        .version(version)
        .build()
        .unwrap()
}

pub fn merge_delta(blob: BlobId, version: u64, diff: Value) -> Delta {
    Delta::builder(blob, DeltaOperation::Update)
        .user(TEST_USER)
        .merge(diff)
        .version(version)
        .build()
        .unwrap()
}

pub fn transform_delta(
    blob: BlobId,
    version: u64,
    provider: &str,
    children: &[BlobId],
    content: Value,
) -> Delta {
    let mut builder = Delta::builder(blob, DeltaOperation::Transform)
        .user(TEST_USER)
        .provider(provider)
        .replace(content)
        .version(version);
    for child in children {
        builder = builder.child(*child);
    }
    builder.build().unwrap()
}

pub fn delete_delta(blob: BlobId, version: u64) -> Delta {
    Delta::builder(blob, DeltaOperation::Delete)
        .user(TEST_USER)
        .version(version)
        .build()
        .unwrap()
}

pub fn revert_delta(blob: BlobId, version: u64, target: DeltaId) -> Delta {
    Delta::builder(blob, DeltaOperation::Revert)
        .user(TEST_USER)
        .caused_by(target)
        .version(version)
        .build()
        .unwrap()
}

/// What a [`ScriptedProvider`] does when called
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Source content as a string, with a suffix appended
    Echo { suffix: String },
    Fail(String),
    /// Sleep, then echo with no suffix
    Sleep(Duration),
    Skip,
}

/// Provider with fixed behavior and per-blob failure overrides
#[derive(Debug)]
pub struct ScriptedProvider {
    behavior: Behavior,
    fail_on: HashSet<BlobId>,
    calls: AtomicUsize,
    seen: Mutex<Vec<BlobId>>,
}

impl ScriptedProvider {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            fail_on: HashSet::new(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn echo(suffix: &str) -> Self {
        Self::new(Behavior::Echo {
            suffix: suffix.to_string(),
        })
    }

    #[must_use]
    pub fn failing_on(mut self, blob: BlobId) -> Self {
        self.fail_on.insert(blob);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<BlobId> {
        self.seen.lock().clone()
    }

    fn echo_content(input: &TransformInput, suffix: &str) -> Value {
        let base = input
            .source
            .as_ref()
            .map(|s| match &s.content {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        json!(format!("{base}{suffix}"))
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    async fn transform(&self, input: TransformInput) -> Result<ProviderOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(input.blob_id);
        if self.fail_on.contains(&input.blob_id) {
            return Err(ProviderError::Fatal(format!("scripted failure for {}", input.blob_id)));
        }
        let content = match &self.behavior {
            Behavior::Echo { suffix } => Self::echo_content(&input, suffix),
            Behavior::Fail(message) => return Err(ProviderError::Fatal(message.clone())),
            Behavior::Sleep(delay) => {
                tokio::time::sleep(*delay).await;
                Self::echo_content(&input, "")
            }
            Behavior::Skip => return Ok(ProviderOutput::Skip),
        };
        Ok(ProviderOutput::Content {
            content,
            content_type: "text/plain".into(),
        })
    }
}

/// Dispatcher that records every request and answers from a script
///
/// Unscripted blobs complete with a fresh delta id.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    results: Mutex<HashMap<BlobId, DispatchResult>>,
    delays: Mutex<HashMap<BlobId, Duration>>,
    requests: Mutex<Vec<DispatchRequest>>,
    /// (blob, "start" | "finish") in the order they happened
    events: Mutex<Vec<(BlobId, &'static str)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, blob: BlobId, message: &str) {
        self.results.lock().insert(
            blob,
            DispatchResult::Failed(DispatchError::Provider {
                message: message.to_string(),
                transient: false,
            }),
        );
    }

    /// Drop a scripted result so the blob completes again
    pub fn succeed(&self, blob: BlobId) {
        self.results.lock().remove(&blob);
    }

    pub fn delay(&self, blob: BlobId, delay: Duration) {
        self.delays.lock().insert(blob, delay);
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().clone()
    }

    pub fn dispatched(&self) -> Vec<BlobId> {
        self.requests.lock().iter().map(|r| r.blob_id).collect()
    }

    /// Position of an event in the log, if it happened
    pub fn position(&self, blob: BlobId, event: &str) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .position(|(b, e)| *b == blob && *e == event)
    }
}

#[async_trait::async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        let blob = request.blob_id;
        self.requests.lock().push(request);
        self.events.lock().push((blob, "start"));

        let delay = self.delays.lock().get(&blob).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.events.lock().push((blob, "finish"));
        self.results
            .lock()
            .get(&blob)
            .cloned()
            .unwrap_or_else(|| DispatchResult::Completed(DeltaId::new()))
    }
}
