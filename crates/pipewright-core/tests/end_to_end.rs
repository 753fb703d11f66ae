mod common;

use pipewright_core::engine::StartOptions;
use pipewright_core::harness::TestHarness;
use pipewright_types::event::StageEvent;
use pipewright_types::stage::StageState;
use serde_json::json;

use common::HookLog;

fn index_of(events: &[StageEvent], pred: impl Fn(&StageEvent) -> bool) -> usize {
    events.iter().position(|e| pred(e)).unwrap()
}

fn words() -> StartOptions {
    StartOptions::new().arg(json!(["a", "bb", "ccc"]))
}

#[tokio::test]
async fn sum_of_lengths_fifo() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));

    let root = harness.run("sum_lengths", words()).await.unwrap();

    assert_eq!(harness.default_output(root).await.unwrap(), Some(json!(6)));
    let tree = harness.engine().tree(root).await.unwrap();
    assert_eq!(tree.len(), 5);
    assert!(tree.iter().all(|r| r.state == StageState::Finalized));
    assert_eq!(log.finalized().len(), 5);
    assert_eq!(harness.pending(), 0);
}

#[tokio::test]
async fn sum_of_lengths_is_independent_of_completion_order() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log)).shuffled();

    let root = harness.run("sum_lengths", words()).await.unwrap();

    assert_eq!(harness.default_output(root).await.unwrap(), Some(json!(6)));
    assert_eq!(harness.record(root).await.unwrap().state, StageState::Finalized);
}

#[tokio::test]
async fn awaiting_generator_completes_with_child_value() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log)).shuffled();

    let root = harness
        .run("sum_lengths_awaiting", StartOptions::new().arg(json!(["xy", "z"])))
        .await
        .unwrap();

    let record = harness.record(root).await.unwrap();
    assert_eq!(record.output("default"), Some(&json!(3)));
    assert_eq!(record.state, StageState::Finalized);
    assert_eq!(record.cursor.step, 1);
    assert!(record.delegate.is_none());
}

#[tokio::test]
async fn barrier_waits_for_every_input() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log)).shuffled();

    let root = harness.run("sum_lengths", words()).await.unwrap();
    let record = harness.record(root).await.unwrap();
    let sum_id = record.children.last().unwrap().id;
    let strlen_ids: Vec<_> = record.children[..3].iter().map(|c| c.id).collect();

    let events = harness.events();
    let sum_created = index_of(&events, |e| {
        matches!(e, StageEvent::Created { stage_id, .. } if *stage_id == sum_id)
    });
    for id in strlen_ids {
        let completed = index_of(&events, |e| {
            matches!(e, StageEvent::Completed { stage_id, .. } if *stage_id == id)
        });
        assert!(completed < sum_created, "sum created before {id} completed");
    }

    let sum = harness.record(sum_id).await.unwrap();
    assert_eq!(sum.args, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn named_outputs_feed_dependents() {
    use pipewright_core::context::{ChildSpec, StageContext};
    use pipewright_core::logic::{Outcome, StageError, StageLogic};

    struct SwapHalves;

    impl StageLogic for SwapHalves {
        fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
            let text: String = ctx.arg_as(0)?;
            let split = ctx.spawn("split", ChildSpec::new().arg(json!(text)))?;
            let swapped = ctx.spawn(
                "concat",
                ChildSpec::new()
                    .arg(split.output("tail")?)
                    .arg(split.output("head")?),
            )?;
            Ok(Outcome::Delegate(swapped))
        }
    }

    let log = HookLog::default();
    let registry = common::registry(&log).with("swap_halves", SwapHalves);
    let harness = TestHarness::new(registry);

    let root = harness
        .run("swap_halves", StartOptions::new().arg(json!("abcdef")))
        .await
        .unwrap();

    assert_eq!(harness.default_output(root).await.unwrap(), Some(json!("defabc")));
    let split_id = harness.record(root).await.unwrap().children[0].id;
    let outputs = harness.outputs(split_id).await.unwrap();
    assert_eq!(outputs.get("head"), Some(&json!("abc")));
    assert_eq!(outputs.get("tail"), Some(&json!("def")));
    assert_eq!(outputs.get("default"), Some(&json!(6)));
}

#[tokio::test]
async fn output_filled_events_are_emitted_once_per_slot() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));

    let root = harness.run("sum_lengths", words()).await.unwrap();

    let fills = harness
        .events_for(root)
        .into_iter()
        .filter(|e| matches!(e, StageEvent::OutputFilled { .. }))
        .count();
    assert_eq!(fills, 1);
}

#[tokio::test]
async fn unknown_root_kind_is_rejected() {
    let log = HookLog::default();
    let harness = TestHarness::new(common::registry(&log));
    let err = harness.start("missing", StartOptions::new()).await.unwrap_err();
    assert!(err.to_string().contains("missing"));
}
