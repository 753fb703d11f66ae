mod common;

use pipewright_core::engine::StartOptions;
use pipewright_core::harness::TestHarness;
use pipewright_types::event::StageEvent;
use pipewright_types::stage::StageState;
use serde_json::json;

use common::HookLog;

fn gcd_args(a: u64, b: u64) -> StartOptions {
    StartOptions::new().arg(json!(a)).arg(json!(b))
}

#[tokio::test]
async fn recursive_gcd_resolves_at_the_root() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));

    let root = harness.run("gcd", gcd_args(1071, 462)).await.unwrap();

    assert_eq!(harness.default_output(root).await.unwrap(), Some(json!(21)));

    // (1071, 462) -> (462, 147) -> (147, 21) -> (21, 0)
    let tree = harness.engine().tree(root).await.unwrap();
    assert_eq!(tree.len(), 4);
    assert!(tree.iter().all(|r| r.output("default") == Some(&json!(21))));
    assert!(tree.iter().all(|r| r.state == StageState::Finalized));
}

#[tokio::test]
async fn root_finalizes_after_the_deepest_descendant() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log)).shuffled();

    let root = harness.run("gcd", gcd_args(1071, 462)).await.unwrap();

    let tree = harness.engine().tree(root).await.unwrap();
    let deepest = tree
        .iter()
        .find(|r| r.args == vec![json!(21), json!(0)])
        .unwrap()
        .id;

    let events = harness.events();
    let filled_deepest = events
        .iter()
        .position(|e| matches!(e, StageEvent::OutputFilled { stage_id, .. } if *stage_id == deepest))
        .unwrap();
    let filled_root = events
        .iter()
        .position(|e| matches!(e, StageEvent::OutputFilled { stage_id, .. } if *stage_id == root))
        .unwrap();
    let finalized_root = events
        .iter()
        .position(|e| matches!(e, StageEvent::Finalized { stage_id, .. } if *stage_id == root))
        .unwrap();
    assert!(filled_deepest < filled_root);
    assert!(filled_root < finalized_root);

    // The delegation chain finalizes bottom-up.
    let finalized = log.finalized();
    assert_eq!(finalized.first(), Some(&deepest));
    assert_eq!(finalized.last(), Some(&root));
}

#[tokio::test]
async fn inherited_outputs_are_flagged_on_the_delegate() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));

    let root = harness.run("gcd", gcd_args(10, 4)).await.unwrap();
    let record = harness.record(root).await.unwrap();
    let delegate = record.delegate.unwrap();
    let child = harness.record(delegate).await.unwrap();

    assert!(child.inherited_outputs.contains("default"));
    assert_eq!(child.parent_id, Some(root));
    assert_eq!(harness.default_output(root).await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn gcd_base_case_completes_directly() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));

    let root = harness.run("gcd", gcd_args(9, 0)).await.unwrap();
    let record = harness.record(root).await.unwrap();
    assert_eq!(record.output("default"), Some(&json!(9)));
    assert!(record.children.is_empty());
    assert_eq!(record.state, StageState::Finalized);
}

#[tokio::test]
async fn delegate_from_an_earlier_step_is_flagged() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));

    let root = harness.run("delegate_later", StartOptions::new()).await.unwrap();
    let record = harness.record(root).await.unwrap();
    assert_eq!(record.state, StageState::Finalized);
    assert_eq!(record.delegate, Some(record.children[1].id));
    assert_eq!(harness.default_output(root).await.unwrap(), Some(json!(4)));

    let delegate = harness.record(record.children[1].id).await.unwrap();
    assert!(delegate.inherited_outputs.contains("default"));
    let awaited = harness.record(record.children[0].id).await.unwrap();
    assert!(awaited.inherited_outputs.is_empty());
}
