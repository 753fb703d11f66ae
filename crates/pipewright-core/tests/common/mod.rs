//! Stage kinds shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pipewright_core::context::{ChildSpec, FinalizeContext, StageContext};
use pipewright_core::logic::{Outcome, StageError, StageLogic, StageRegistry};
use pipewright_core::store::{InMemoryStageStore, StageStore};
use pipewright_types::error::StoreError;
use pipewright_types::stage::{CallbackAccess, StageId, StageRecord};
use serde_json::{Value, json};

/// Length of the string argument.
pub struct StrLen;

impl StageLogic for StrLen {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let word: String = ctx.arg_as(0)?;
        Ok(Outcome::Complete(json!(word.len())))
    }
}

/// Sum of all integer arguments.
pub struct Sum;

impl StageLogic for Sum {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let total: i64 = ctx.args().iter().filter_map(Value::as_i64).sum();
        Ok(Outcome::Complete(json!(total)))
    }
}

/// One `strlen` child per word, a `sum` over their outputs, and tail
/// delegation to the sum.
pub struct SumLengths;

impl StageLogic for SumLengths {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let words: Vec<String> = ctx.arg_as(0)?;
        let mut lengths = Vec::new();
        for word in words {
            lengths.push(ctx.spawn("strlen", ChildSpec::new().arg(json!(word)))?);
        }
        let sum = ctx.spawn("sum", ChildSpec::new().args(&lengths))?;
        Ok(Outcome::Delegate(sum))
    }
}

/// Same as `SumLengths` but waits for the sum itself.
pub struct SumLengthsAwaiting;

impl StageLogic for SumLengthsAwaiting {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        match ctx.step() {
            0 => {
                let words: Vec<String> = ctx.arg_as(0)?;
                let mut lengths = Vec::new();
                for word in words {
                    lengths.push(ctx.spawn("strlen", ChildSpec::new().arg(json!(word)))?);
                }
                let sum = ctx.spawn("sum", ChildSpec::new().args(&lengths))?;
                Ok(Outcome::await_children([&sum]))
            }
            _ => {
                let children = ctx.children();
                let sum = children
                    .last()
                    .and_then(|sum| ctx.value_of(sum))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(Outcome::Complete(sum))
            }
        }
    }
}

/// Euclid by recursive tail delegation.
pub struct Gcd;

impl StageLogic for Gcd {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let a: u64 = ctx.arg_as(0)?;
        let b: u64 = ctx.arg_as(1)?;
        if b == 0 {
            return Ok(Outcome::Complete(json!(a)));
        }
        let next = ctx.spawn("gcd", ChildSpec::new().arg(json!(b)).arg(json!(a % b)))?;
        Ok(Outcome::Delegate(next))
    }
}

/// Fills two named outputs from a string argument.
pub struct Split;

impl StageLogic for Split {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let text: String = ctx.arg_as(0)?;
        let (head, tail) = text.split_at(text.len() / 2);
        ctx.outputs().fill("head", head)?;
        ctx.outputs().fill("tail", tail)?;
        Ok(Outcome::Complete(json!(text.len())))
    }

    fn output_names(&self) -> &[&str] {
        &["head", "tail"]
    }
}

/// Concatenates string arguments.
pub struct Concat;

impl StageLogic for Concat {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let joined: String = ctx.args().iter().filter_map(Value::as_str).collect();
        Ok(Outcome::Complete(json!(joined)))
    }
}

/// Waits for an external decision. Anyone with a signed request may
/// resume it.
pub struct Approval;

impl StageLogic for Approval {
    fn run(&self, _ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        Ok(Outcome::Suspend)
    }

    fn callback(&self, ctx: &mut StageContext<'_>, payload: &Value) -> Result<Outcome, StageError> {
        match payload.get("approved").and_then(Value::as_bool) {
            Some(approved) => Ok(Outcome::Complete(json!({
                "request": ctx.arg(0).cloned().unwrap_or(Value::Null),
                "approved": approved,
            }))),
            None => Err(StageError::Failed("payload has no decision".to_string())),
        }
    }

    fn callback_access(&self) -> CallbackAccess {
        CallbackAccess::Privileged
    }
}

/// Suspends forever; used as a pending descendant.
pub struct Forever;

impl StageLogic for Forever {
    fn run(&self, _ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        Ok(Outcome::Suspend)
    }

    fn callback_access(&self) -> CallbackAccess {
        CallbackAccess::Public
    }
}

/// Two suspended children, then waits on both.
pub struct TwoPending;

impl StageLogic for TwoPending {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        match ctx.step() {
            0 => {
                let a = ctx.spawn("forever", ChildSpec::new())?;
                let b = ctx.spawn("forever", ChildSpec::new())?;
                Ok(Outcome::await_children([&a, &b]))
            }
            _ => Ok(Outcome::Done),
        }
    }
}

/// Fails recoverably until it has been called `failures + 1` times.
pub struct Flaky {
    pub failures: usize,
    pub calls: Arc<AtomicUsize>,
}

impl StageLogic for Flaky {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StageError::Failed(format!("flaky call {call}")));
        }
        Ok(Outcome::Complete(json!(ctx.attempt())))
    }
}

/// Always fails with the configured error.
pub struct Broken(pub StageError);

impl StageLogic for Broken {
    fn run(&self, _ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        Err(self.0.clone())
    }
}

/// A parent with one healthy child and one broken child.
pub struct HalfBroken;

impl StageLogic for HalfBroken {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        match ctx.step() {
            0 => {
                let ok = ctx.spawn("forever", ChildSpec::new())?;
                let bad = ctx.spawn("broken", ChildSpec::new())?;
                Ok(Outcome::await_children([&ok, &bad]))
            }
            _ => Ok(Outcome::Done),
        }
    }
}

/// Declares `count` `strlen` children under an `in_order` scope.
pub struct InOrderChain;

impl StageLogic for InOrderChain {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        match ctx.step() {
            0 => {
                let words: Vec<String> = ctx.arg_as(0)?;
                let children = ctx.with_in_order(|ctx| {
                    words
                        .iter()
                        .map(|w| ctx.spawn("strlen", ChildSpec::new().arg(json!(w))))
                        .collect::<Result<Vec<_>, _>>()
                })?;
                Ok(Outcome::await_children(&children))
            }
            _ => Ok(Outcome::Done),
        }
    }
}

/// Declares a first child, then two more that wait for it via `after`.
pub struct AfterFanOut;

impl StageLogic for AfterFanOut {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        match ctx.step() {
            0 => {
                let first = ctx.spawn("strlen", ChildSpec::new().arg(json!("first")))?;
                let rest = ctx.with_after([&first], |ctx| {
                    let a = ctx.spawn("strlen", ChildSpec::new().arg(json!("a")))?;
                    let b = ctx.spawn("strlen", ChildSpec::new().arg(json!("bb")))?;
                    Ok(vec![a, b])
                })?;
                let free = ctx.spawn("strlen", ChildSpec::new().arg(json!("free")))?;
                let mut all = vec![first, free];
                all.extend(rest);
                Ok(Outcome::await_children(&all))
            }
            _ => Ok(Outcome::Done),
        }
    }
}

/// Tries to nest `in_order` scopes.
pub struct NestedInOrder;

impl StageLogic for NestedInOrder {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        ctx.in_order()?;
        ctx.in_order()?;
        Ok(Outcome::Done)
    }
}

/// Declares two children, waits for the first, then delegates to the
/// second, which by then already exists.
pub struct DelegateLater;

impl StageLogic for DelegateLater {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        match ctx.step() {
            0 => {
                let first = ctx.spawn("strlen", ChildSpec::new().arg(json!("ab")))?;
                ctx.spawn("strlen", ChildSpec::new().arg(json!("abcd")))?;
                Ok(Outcome::await_children([&first]))
            }
            _ => {
                let second = ctx
                    .children()
                    .pop()
                    .ok_or_else(|| StageError::Abort("second child missing".to_string()))?;
                Ok(Outcome::Delegate(second))
            }
        }
    }
}

/// Records every finalize and abort hook invocation of the wrapped logic.
pub struct Observed<L> {
    pub inner: L,
    pub finalized: Arc<Mutex<Vec<StageId>>>,
    pub aborted: Arc<Mutex<Vec<StageId>>>,
}

impl<L: StageLogic> StageLogic for Observed<L> {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
        self.inner.run(ctx)
    }

    fn callback(&self, ctx: &mut StageContext<'_>, payload: &Value) -> Result<Outcome, StageError> {
        self.inner.callback(ctx, payload)
    }

    fn finalize(&self, ctx: &FinalizeContext<'_>) -> Result<(), StageError> {
        self.finalized.lock().unwrap().push(ctx.id());
        self.inner.finalize(ctx)
    }

    fn aborted(&self, ctx: &FinalizeContext<'_>) {
        self.aborted.lock().unwrap().push(ctx.id());
        self.inner.aborted(ctx)
    }

    fn callback_access(&self) -> CallbackAccess {
        self.inner.callback_access()
    }

    fn output_names(&self) -> &[&str] {
        self.inner.output_names()
    }
}

/// Hook invocation log shared across every observed kind.
#[derive(Clone, Default)]
pub struct HookLog {
    pub finalized: Arc<Mutex<Vec<StageId>>>,
    pub aborted: Arc<Mutex<Vec<StageId>>>,
}

impl HookLog {
    pub fn observe<L: StageLogic>(&self, inner: L) -> Observed<L> {
        Observed {
            inner,
            finalized: self.finalized.clone(),
            aborted: self.aborted.clone(),
        }
    }

    pub fn finalized(&self) -> Vec<StageId> {
        self.finalized.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<StageId> {
        self.aborted.lock().unwrap().clone()
    }

    pub fn finalize_count(&self, id: StageId) -> usize {
        self.finalized().iter().filter(|f| **f == id).count()
    }
}

/// Every kind above, with finalize/abort hooks recorded in `log`.
pub fn registry(log: &HookLog) -> StageRegistry {
    StageRegistry::new()
        .with("strlen", log.observe(StrLen))
        .with("sum", log.observe(Sum))
        .with("sum_lengths", log.observe(SumLengths))
        .with("sum_lengths_awaiting", log.observe(SumLengthsAwaiting))
        .with("gcd", log.observe(Gcd))
        .with("split", log.observe(Split))
        .with("concat", log.observe(Concat))
        .with("approval", log.observe(Approval))
        .with("forever", log.observe(Forever))
        .with("two_pending", log.observe(TwoPending))
        .with("in_order_chain", log.observe(InOrderChain))
        .with("after_fan_out", log.observe(AfterFanOut))
        .with("nested_in_order", log.observe(NestedInOrder))
        .with("broken", log.observe(Broken(StageError::Abort("broken on purpose".to_string()))))
        .with("half_broken", log.observe(HalfBroken))
        .with("delegate_later", log.observe(DelegateLater))
}

/// Failure injected into one compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The write is rejected as if the connection dropped.
    Connection,
    /// Another writer bumps the record first, so the write conflicts.
    RacingWriter,
}

type Trigger = Box<dyn Fn(&StageRecord) -> bool + Send + Sync>;

/// In-memory store that fails chosen writes once each.
pub struct FlakyStore {
    inner: InMemoryStageStore,
    faults: Mutex<Vec<(Fault, Trigger)>>,
    injected: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStageStore::new(),
            faults: Mutex::new(Vec::new()),
            injected: AtomicUsize::new(0),
        }
    }

    /// Inject `fault` into the first write whose new record matches `when`.
    pub fn fail_once(
        self,
        fault: Fault,
        when: impl Fn(&StageRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.faults.lock().unwrap().push((fault, Box::new(when)));
        self
    }

    /// Faults injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_fault(&self, record: &StageRecord) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();
        let index = faults.iter().position(|(_, when)| when(record))?;
        let (fault, _) = faults.remove(index);
        self.injected.fetch_add(1, Ordering::SeqCst);
        Some(fault)
    }
}

impl StageStore for FlakyStore {
    async fn get(&self, id: &StageId) -> Result<Option<StageRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn compare_and_swap(
        &self,
        record: &StageRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        match self.take_fault(record) {
            Some(Fault::Connection) => return Err(StoreError::Connection),
            Some(Fault::RacingWriter) => {
                if let Some(mut current) = self.inner.get(&record.id).await? {
                    let version = current.version;
                    current.version += 1;
                    self.inner.compare_and_swap(&current, version).await?;
                }
            }
            None => {}
        }
        self.inner.compare_and_swap(record, expected_version).await
    }

    async fn list_tree(&self, root_id: &StageId) -> Result<Vec<StageRecord>, StoreError> {
        self.inner.list_tree(root_id).await
    }
}
