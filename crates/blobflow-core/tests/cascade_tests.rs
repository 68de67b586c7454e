use blobflow_cascade::{
    CascadePhase, CascadeStatus, DispatchError, FailurePolicy, NodeOutcome, SkipReason,
    TriggerEvent,
};
use blobflow_core::{ChangeEvent, ChangeKind, ContentEngine, EngineConfig, EngineError};
use blobflow_delta::{BlobId, Delta, DeltaOperation, ProviderId, ProviderStatus};
use blobflow_test_utils::{
    create_delta, delete_delta, transform_delta, update_delta, RecordingDispatcher,
    ScriptedProvider, TEST_USER,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Create a blob derived from `parent` on behalf of `provider`
fn derived(blob: BlobId, parent: BlobId, provider: &str) -> Delta {
    Delta::builder(blob, DeltaOperation::Create)
        .user(TEST_USER)
        .provider(provider)
        .init(json!(blob.to_string()), "text/plain")
        .parent(parent)
        .build()
        .unwrap()
}

fn drain(events: &mut broadcast::Receiver<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_transform_cascade_creates_child() {
    let provider = Arc::new(ScriptedProvider::echo(", expanded"));
    let engine = ContentEngine::builder()
        .provider("expander", provider.clone())
        .build()
        .unwrap();
    let x = BlobId::new();
    let y = BlobId::new();

    engine.append(create_delta(x, json!("draft"))).await.unwrap();
    let state = engine.get_blob(x, None).await.unwrap();
    assert_eq!((state.content.clone(), state.version), (json!("draft"), 1));

    let transform = engine
        .append(transform_delta(x, 2, "expander", &[y], json!("draft")))
        .await
        .unwrap();
    let edge = engine.dag().edge(x, y).unwrap();
    assert_eq!(edge.provider_id, ProviderId::new("expander"));

    let mut events = engine.subscribe();
    let report = engine.cascade(x).await.unwrap();

    assert_eq!(report.trigger.delta_id, transform.delta.id);
    assert_eq!(report.trigger.event, TriggerEvent::Updated);
    assert_eq!(report.levels, vec![vec![y]]);
    assert_eq!(report.status(), CascadeStatus::Done);
    let Some(NodeOutcome::Completed(produced)) = report.outcome(y).cloned() else {
        panic!("expected y to complete, got {:?}", report.outcome(y));
    };
    assert_eq!(provider.calls(), 1);

    let chain = engine.history(y).await.unwrap();
    assert_eq!(chain.len(), 1);
    let created = &chain[0];
    assert_eq!(created.id, produced);
    assert_eq!(created.operation, DeltaOperation::Create);
    assert_eq!(created.version, 1);
    assert_eq!(created.parent_id, Some(x));
    assert_eq!(created.caused_by, Some(transform.delta.id));
    assert_eq!(created.provider_id, ProviderId::new("expander"));

    let derived = engine.get_blob(y, None).await.unwrap();
    assert_eq!(derived.content, json!("draft, expanded"));
    assert_eq!(derived.user_id.as_str(), TEST_USER);

    let state = engine
        .provider_state(y, &ProviderId::new("expander"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, ProviderStatus::Completed);
    assert_eq!(state.last_trigger, Some(transform.delta.id));
    assert_eq!(state.last_processed_version, 2);

    let kinds: Vec<_> = drain(&mut events).into_iter().map(|e| (e.kind, e.blob_id)).collect();
    assert_eq!(
        kinds,
        vec![
            (ChangeKind::BlobCreated, y),
            (ChangeKind::DeltaApplied, y),
            (ChangeKind::ProcessingComplete, y),
        ]
    );
}

#[tokio::test]
async fn test_partial_failure_keeps_sibling_results() {
    let root = BlobId::new();
    let a = BlobId::new();
    let b = BlobId::new();
    let provider = Arc::new(ScriptedProvider::echo("!").failing_on(a));
    let engine = ContentEngine::builder()
        .provider("gen", provider)
        .build()
        .unwrap();

    engine.append(create_delta(root, json!("root"))).await.unwrap();
    engine
        .append(transform_delta(root, 2, "gen", &[a, b], json!("root")))
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let report = engine.cascade(root).await.unwrap();

    assert!(report.partial_failure());
    assert_eq!(report.status(), CascadeStatus::Failed);
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, a);
    assert!(matches!(
        failures[0].1,
        DispatchError::Provider {
            transient: false,
            ..
        }
    ));
    assert!(matches!(report.outcome(b), Some(NodeOutcome::Completed(_))));

    assert_eq!(engine.get_blob(b, None).await.unwrap().content, json!("root!"));
    assert!(engine.get_blob(a, None).await.is_err());
    assert_eq!(engine.get_blob(root, None).await.unwrap().version, 2);

    let gen = ProviderId::new("gen");
    let failed = engine.provider_state(a, &gen).await.unwrap().unwrap();
    assert_eq!(failed.status, ProviderStatus::Failed);
    assert!(failed.error.unwrap().contains("scripted failure"));
    let ok = engine.provider_state(b, &gen).await.unwrap().unwrap();
    assert_eq!(ok.status, ProviderStatus::Completed);

    let failed_events: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| e.kind == ChangeKind::ProcessingFailed)
        .collect();
    assert_eq!(failed_events.len(), 1);
    assert_eq!(failed_events[0].blob_id, a);
    assert_eq!(failed_events[0].provider_id, Some(gen));
}

#[tokio::test]
async fn test_failed_node_can_be_retriggered() {
    let root = BlobId::new();
    let a = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    dispatcher.fail(a, "flaky");
    let engine = ContentEngine::builder()
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    let transform = engine
        .append(transform_delta(root, 2, "gen", &[a], json!("r")))
        .await
        .unwrap();

    let first = engine.cascade_from(transform.delta.id).await.unwrap();
    assert!(first.partial_failure());

    let second = engine.cascade_from(transform.delta.id).await.unwrap();
    assert!(matches!(second.outcome(a), Some(NodeOutcome::Failed(_))));
    assert_eq!(dispatcher.dispatched(), vec![a, a]);
}

#[tokio::test]
async fn test_redelivered_trigger_is_not_reprocessed() {
    let provider = Arc::new(ScriptedProvider::echo("+"));
    let engine = ContentEngine::builder()
        .provider("expander", provider.clone())
        .build()
        .unwrap();
    let x = BlobId::new();
    let y = BlobId::new();
    engine.append(create_delta(x, json!("x"))).await.unwrap();
    let transform = engine
        .append(transform_delta(x, 2, "expander", &[y], json!("x")))
        .await
        .unwrap();
    let edges = engine.dag().edge_count();

    engine.cascade_from(transform.delta.id).await.unwrap();
    let again = engine.cascade_from(transform.delta.id).await.unwrap();

    assert_eq!(
        again.outcome(y),
        Some(&NodeOutcome::Skipped(SkipReason::AlreadyProcessed))
    );
    assert_eq!(provider.calls(), 1);
    assert_eq!(engine.history(y).await.unwrap().len(), 1);
    assert_eq!(engine.dag().edge_count(), edges);
}

#[tokio::test]
async fn test_new_trigger_updates_existing_child() {
    let provider = Arc::new(ScriptedProvider::echo("+"));
    let engine = ContentEngine::builder()
        .provider("expander", provider.clone())
        .build()
        .unwrap();
    let x = BlobId::new();
    let y = BlobId::new();
    engine.append(create_delta(x, json!("x"))).await.unwrap();
    engine
        .append(transform_delta(x, 2, "expander", &[y], json!("x")))
        .await
        .unwrap();
    engine.cascade(x).await.unwrap();

    engine.append(update_delta(x, 3, json!("x2"))).await.unwrap();
    let report = engine.cascade(x).await.unwrap();

    assert!(matches!(report.outcome(y), Some(NodeOutcome::Completed(_))));
    let chain = engine.history(y).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].operation, DeltaOperation::Update);
    assert_eq!(engine.get_blob(y, None).await.unwrap().content, json!("x2+"));
}

#[tokio::test]
async fn test_diamond_dispatches_shared_child_once_after_its_parent() {
    let root = BlobId::new();
    let a = BlobId::new();
    let b = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    dispatcher.delay(a, Duration::from_millis(30));
    let engine = ContentEngine::builder()
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(a, root, "p")).await.unwrap();
    engine.append(derived(b, root, "p")).await.unwrap();
    engine
        .append(transform_delta(a, 2, "p", &[b], json!("a")))
        .await
        .unwrap();

    let report = engine.cascade(root).await.unwrap();

    assert_eq!(report.levels, vec![vec![a], vec![b]]);
    assert_eq!(dispatcher.dispatched(), vec![a, b]);
    assert!(
        dispatcher.position(a, "finish").unwrap() < dispatcher.position(b, "start").unwrap()
    );
    assert_eq!(
        report.phases,
        vec![
            CascadePhase::Collecting,
            CascadePhase::Leveling,
            CascadePhase::Dispatching(1),
            CascadePhase::Awaiting(1),
            CascadePhase::Dispatching(2),
            CascadePhase::Awaiting(2),
            CascadePhase::Done,
        ]
    );
}

#[tokio::test]
async fn test_requests_carry_provider_event_and_deadline() {
    let root = BlobId::new();
    let a = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    let config = EngineConfig::default().with_dispatch_timeout(Duration::from_secs(2));
    let engine = ContentEngine::builder()
        .config(config)
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(a, root, "p")).await.unwrap();
    engine.cascade(root).await.unwrap();

    let requests = dispatcher.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.provider_id, ProviderId::new("p"));
    assert_eq!(request.blob_id, a);
    assert_eq!(request.event(), TriggerEvent::Created);
    assert!(request.remaining() <= Duration::from_secs(2));
    assert!(request.remaining() > Duration::from_secs(1));
}

#[tokio::test]
async fn test_skip_descendants_policy() {
    let root = BlobId::new();
    let a = BlobId::new();
    let b = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    dispatcher.fail(a, "down");
    let config = EngineConfig::default().with_failure_policy(FailurePolicy::SkipDescendants);
    let engine = ContentEngine::builder()
        .config(config)
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(a, root, "p")).await.unwrap();
    engine.append(derived(b, a, "p")).await.unwrap();

    let report = engine.cascade(root).await.unwrap();

    assert_eq!(
        report.outcome(b),
        Some(&NodeOutcome::Skipped(SkipReason::UpstreamFailed))
    );
    assert_eq!(dispatcher.dispatched(), vec![a]);
}

#[tokio::test]
async fn test_skipped_descendants_run_when_trigger_is_retried() {
    let root = BlobId::new();
    let a = BlobId::new();
    let c = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    dispatcher.fail(a, "down");
    let config = EngineConfig::default().with_failure_policy(FailurePolicy::SkipDescendants);
    let engine = ContentEngine::builder()
        .config(config)
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();

    let created = engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(a, root, "p")).await.unwrap();
    engine.append(derived(c, a, "p")).await.unwrap();

    let first = engine.cascade_from(created.delta.id).await.unwrap();
    assert!(matches!(first.outcome(a), Some(NodeOutcome::Failed(_))));
    assert_eq!(
        first.outcome(c),
        Some(&NodeOutcome::Skipped(SkipReason::UpstreamFailed))
    );

    dispatcher.succeed(a);
    let second = engine.cascade_from(created.delta.id).await.unwrap();

    assert_eq!(second.status(), CascadeStatus::Done);
    assert!(matches!(second.outcome(a), Some(NodeOutcome::Completed(_))));
    assert!(matches!(second.outcome(c), Some(NodeOutcome::Completed(_))));
    assert_eq!(dispatcher.dispatched(), vec![a, a, c]);
}

#[tokio::test]
async fn test_tombstone_does_not_unblock_descendants_of_a_failure() {
    let root = BlobId::new();
    let a = BlobId::new();
    let gone = BlobId::new();
    let c = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    dispatcher.fail(a, "down");
    let config = EngineConfig::default().with_failure_policy(FailurePolicy::SkipDescendants);
    let engine = ContentEngine::builder()
        .config(config)
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(a, root, "p")).await.unwrap();
    engine.append(derived(gone, a, "p")).await.unwrap();
    engine.append(derived(c, gone, "p")).await.unwrap();
    engine.append(delete_delta(gone, 2)).await.unwrap();

    let report = engine.cascade(root).await.unwrap();

    assert_eq!(report.levels, vec![vec![a], vec![gone], vec![c]]);
    assert_eq!(
        report.outcome(gone),
        Some(&NodeOutcome::Skipped(SkipReason::Tombstoned))
    );
    assert_eq!(
        report.outcome(c),
        Some(&NodeOutcome::Skipped(SkipReason::UpstreamFailed))
    );
    assert_eq!(dispatcher.dispatched(), vec![a]);
}

#[tokio::test]
async fn test_dispatch_timeout_is_reported_per_node() {
    let root = BlobId::new();
    let slow = BlobId::new();
    let fast = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    dispatcher.delay(slow, Duration::from_millis(500));
    let config = EngineConfig::default().with_dispatch_timeout(Duration::from_millis(50));
    let engine = ContentEngine::builder()
        .config(config)
        .dispatcher(dispatcher)
        .build()
        .unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(slow, root, "p")).await.unwrap();
    engine.append(derived(fast, root, "p")).await.unwrap();

    let report = engine.cascade(root).await.unwrap();

    assert!(matches!(
        report.outcome(slow),
        Some(NodeOutcome::Failed(DispatchError::Timeout(_)))
    ));
    assert!(matches!(report.outcome(fast), Some(NodeOutcome::Completed(_))));

    let errors = EngineError::from_report(&report);
    assert_eq!(
        errors,
        vec![EngineError::DispatchTimeout {
            blob: slow,
            after: Duration::from_millis(50)
        }]
    );
    assert!(errors[0].is_retryable());
}

#[tokio::test]
async fn test_tombstoned_descendant_is_skipped() {
    let root = BlobId::new();
    let gone = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    let engine = ContentEngine::builder()
        .dispatcher(dispatcher.clone())
        .build()
        .unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(gone, root, "p")).await.unwrap();
    engine.append(delete_delta(gone, 2)).await.unwrap();

    let report = engine.cascade(root).await.unwrap();

    assert_eq!(
        report.outcome(gone),
        Some(&NodeOutcome::Skipped(SkipReason::Tombstoned))
    );
    assert!(dispatcher.dispatched().is_empty());
}

#[tokio::test]
async fn test_deleting_root_cancels_running_cascade() {
    let root = BlobId::new();
    let a = BlobId::new();
    let b = BlobId::new();
    let dispatcher = RecordingDispatcher::new();
    dispatcher.delay(a, Duration::from_millis(200));
    let engine = Arc::new(
        ContentEngine::builder()
            .dispatcher(dispatcher.clone())
            .build()
            .unwrap(),
    );

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(a, root, "p")).await.unwrap();
    engine.append(derived(b, a, "p")).await.unwrap();

    let running = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.cascade(root).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.append(delete_delta(root, 2)).await.unwrap();

    let report = running.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.status(), CascadeStatus::Cancelled);
    assert!(matches!(report.outcome(a), Some(NodeOutcome::Completed(_))));
    assert!(report.outcome(b).is_none());
    assert_eq!(dispatcher.dispatched(), vec![a]);
}

#[tokio::test]
async fn test_user_edges_are_declined_by_registry() {
    let root = BlobId::new();
    let a = BlobId::new();
    let engine = ContentEngine::new(EngineConfig::default()).unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine
        .append(blobflow_test_utils::create_child_delta(a, root, json!("a")))
        .await
        .unwrap();

    let report = engine.cascade(root).await.unwrap();
    assert_eq!(
        report.outcome(a),
        Some(&NodeOutcome::Skipped(SkipReason::Declined))
    );
    assert!(!report.partial_failure());
}

#[tokio::test]
async fn test_unknown_provider_fails_node() {
    let root = BlobId::new();
    let a = BlobId::new();
    let engine = ContentEngine::new(EngineConfig::default()).unwrap();

    engine.append(create_delta(root, json!("r"))).await.unwrap();
    engine.append(derived(a, root, "nobody")).await.unwrap();

    let report = engine.cascade(root).await.unwrap();
    assert!(matches!(
        report.outcome(a),
        Some(NodeOutcome::Failed(DispatchError::UnknownProvider(_)))
    ));
    let errors = EngineError::from_report(&report);
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], EngineError::DispatchFailure { blob, .. } if *blob == a));
    assert_eq!(errors[0].kind(), "dispatch_failure");
}

#[tokio::test]
async fn test_auto_cascade_processes_new_children() {
    let mut engine = ContentEngine::builder()
        .config(EngineConfig::default().with_auto_cascade(true))
        .provider("expander", Arc::new(ScriptedProvider::echo(", expanded")))
        .build()
        .unwrap();
    let mut events = engine.subscribe();
    let x = BlobId::new();
    let y = BlobId::new();

    engine.append(create_delta(x, json!("draft"))).await.unwrap();
    engine
        .append(transform_delta(x, 2, "expander", &[y], json!("draft")))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.kind == ChangeKind::ProcessingComplete && event.blob_id == y {
                return event;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(event.provider_id, Some(ProviderId::new("expander")));
    assert_eq!(
        engine.get_blob(y, None).await.unwrap().content,
        json!("draft, expanded")
    );
    engine.shutdown().await;
}
