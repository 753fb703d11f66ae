mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pipewright_core::engine::{ResumeError, StartOptions};
use pipewright_core::harness::TestHarness;
use pipewright_types::event::StageEvent;
use pipewright_types::stage::{RetryPolicy, StageState};
use serde_json::json;

use common::{Flaky, HookLog};

fn flaky_harness(log: &HookLog, failures: usize) -> (TestHarness, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = common::registry(log).with(
        "flaky",
        log.observe(Flaky {
            failures,
            calls: calls.clone(),
        }),
    );
    (TestHarness::new(registry), calls)
}

#[tokio::test]
async fn recoverable_failures_are_retried() {
    let log = HookLog::default();
    let (harness, calls) = flaky_harness(&log, 2);

    let root = harness.run("flaky", StartOptions::new()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let record = harness.record(root).await.unwrap();
    assert_eq!(record.state, StageState::Finalized);
    assert_eq!(record.attempt, 3);
    assert_eq!(record.output("default"), Some(&json!(3)));

    let retries: Vec<_> = harness
        .events_for(root)
        .into_iter()
        .filter_map(|e| match e {
            StageEvent::Retrying { attempt, delay_secs, .. } => Some((attempt, delay_secs)),
            _ => None,
        })
        .collect();
    // Default policy: 15s, then 30s.
    assert_eq!(retries, vec![(2, 15), (3, 30)]);
}

#[tokio::test]
async fn exhausted_retries_abort_the_workflow() {
    let log = HookLog::default();
    let (harness, calls) = flaky_harness(&log, 10);
    let policy = RetryPolicy {
        max_attempts: 2,
        ..RetryPolicy::default()
    };

    let root = harness
        .run("flaky", StartOptions::new().retry(policy))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let record = harness.record(root).await.unwrap();
    assert_eq!(record.state, StageState::Aborted);
    assert!(record.last_error.unwrap().starts_with("giving up after 2 attempts"));
    assert_eq!(log.aborted(), vec![root]);
    assert!(log.finalized().is_empty());
}

#[tokio::test]
async fn fatal_child_error_aborts_the_whole_tree() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));

    let root = harness.run("half_broken", StartOptions::new()).await.unwrap();

    let tree = harness.engine().tree(root).await.unwrap();
    assert_eq!(tree.len(), 3);
    assert!(tree.iter().all(|r| r.state == StageState::Aborted));

    let broken = tree.iter().find(|r| r.kind == "broken").unwrap();
    assert!(broken.last_error.as_deref().unwrap().contains("broken on purpose"));
    let reason = tree[0].abort_reason.as_deref().unwrap();
    assert!(reason.contains(&broken.id.to_string()));

    assert_eq!(log.aborted().len(), 3);
    assert!(log.finalized().is_empty());
}

#[tokio::test]
async fn abort_stops_pending_stages_once() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));
    let root = harness.run("two_pending", StartOptions::new()).await.unwrap();
    let children: Vec<_> = harness
        .record(root)
        .await
        .unwrap()
        .children
        .iter()
        .map(|c| c.id)
        .collect();

    let first = harness.abort(root, "operator request").await.unwrap();
    assert_eq!(first.aborted.len(), 3);
    assert_eq!(first.aborted[0], root);

    let second = harness.abort(root, "operator request").await.unwrap();
    assert!(second.aborted.is_empty());
    assert_eq!(log.aborted().len(), 3);
    assert!(log.finalized().is_empty());

    for child in children {
        let record = harness.record(child).await.unwrap();
        assert_eq!(record.state, StageState::Aborted);
        assert_eq!(record.abort_reason.as_deref(), Some("operator request"));

        let err = harness.resume(child, json!({})).await.unwrap_err();
        assert!(matches!(err, ResumeError::UnknownStage(_)));
    }
}

#[tokio::test]
async fn aborting_a_descendant_aborts_from_the_root() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));
    let root = harness.run("two_pending", StartOptions::new()).await.unwrap();
    let child = harness.record(root).await.unwrap().children[1].id;

    let result = harness.abort(child, "cancelled").await.unwrap();

    assert_eq!(result.aborted.len(), 3);
    assert_eq!(harness.record(root).await.unwrap().state, StageState::Aborted);
}

#[tokio::test]
async fn finished_stages_are_not_aborted() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));
    let root = harness
        .run("sum", StartOptions::new().arg(1).arg(2))
        .await
        .unwrap();

    let result = harness.abort(root, "too late").await.unwrap();

    assert!(result.aborted.is_empty());
    assert_eq!(harness.record(root).await.unwrap().state, StageState::Finalized);
}
