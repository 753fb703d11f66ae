//! Execution contexts handed to stage logic.
//!
//! [`StageContext`] is the only window running logic has onto its stage:
//! identity, arguments, write-only output handles, child declaration and
//! the ordering scopes. [`FinalizeContext`] is the read-only view given to
//! the finalize and abort hooks.

use std::collections::BTreeMap;

use pipewright_types::stage::{
    Arg, ChildDeclaration, DEFAULT_OUTPUT, RetryPolicy, SlotRef, StageId, StageRecord,
    StageState,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::identity;
use crate::logic::{StageError, StageRegistry};
use crate::ordering::OrderingStack;
use crate::slots::OutputHandles;

// ---------------------------------------------------------------------------
// ChildHandle
// ---------------------------------------------------------------------------

/// Handle to a declared child stage.
///
/// Converts into a future ([`SlotRef`]) for any of the child's declared
/// outputs, and into an [`Arg`] for its `default` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildHandle {
    id: StageId,
    position: u32,
    kind: String,
    outputs: Vec<String>,
}

impl ChildHandle {
    fn from_declaration(decl: &ChildDeclaration) -> Self {
        Self {
            id: decl.id,
            position: decl.position,
            kind: decl.kind.clone(),
            outputs: decl.output_names.clone(),
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn default_output(&self) -> SlotRef {
        SlotRef::default_of(self.id)
    }

    /// Future for a named output; fails fast if the child does not declare it.
    pub fn output(&self, name: &str) -> Result<SlotRef, StageError> {
        if self.outputs.iter().any(|n| n == name) {
            Ok(SlotRef::named(self.id, name))
        } else {
            Err(StageError::UndeclaredOutput(name.to_string()))
        }
    }
}

impl From<&ChildHandle> for Arg {
    fn from(handle: &ChildHandle) -> Self {
        Arg::Future(handle.default_output())
    }
}

impl From<ChildHandle> for Arg {
    fn from(handle: ChildHandle) -> Self {
        Arg::Future(handle.default_output())
    }
}

// ---------------------------------------------------------------------------
// ChildSpec
// ---------------------------------------------------------------------------

/// Arguments and options for a child declaration.
#[derive(Debug, Clone, Default)]
pub struct ChildSpec {
    args: Vec<Arg>,
    kwargs: BTreeMap<String, Arg>,
    after: Vec<StageId>,
    queue: Option<String>,
    retry: Option<RetryPolicy>,
    outputs: Vec<String>,
}

impl ChildSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<A: Into<Arg>>(mut self, args: impl IntoIterator<Item = A>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.kwargs.insert(name.into(), arg.into());
        self
    }

    /// Wait for `sibling` to complete, in addition to any scoped ordering.
    pub fn after(mut self, sibling: &ChildHandle) -> Self {
        self.after.push(sibling.id());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Declare an extra named output beyond those the child's logic lists.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }
}

// ---------------------------------------------------------------------------
// StageContext
// ---------------------------------------------------------------------------

/// Execution context for one evaluation of a stage's logic.
pub struct StageContext<'a> {
    record: &'a StageRecord,
    registry: &'a StageRegistry,
    step: u32,
    outputs: OutputHandles<'a>,
    declared: Vec<ChildDeclaration>,
    ordering: OrderingStack,
    locals: Map<String, Value>,
}

/// Everything an evaluation produced, ready to be committed.
pub(crate) struct ContextEffects {
    pub fills: BTreeMap<String, Value>,
    pub declared: Vec<ChildDeclaration>,
    pub ordering: OrderingStack,
    pub locals: Map<String, Value>,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(record: &'a StageRecord, registry: &'a StageRegistry) -> Self {
        Self {
            record,
            registry,
            step: record.cursor.step,
            outputs: OutputHandles::new(record),
            declared: Vec::new(),
            ordering: OrderingStack::from_frames(record.cursor.ordering.clone()),
            locals: record.cursor.locals.clone(),
        }
    }

    pub fn id(&self) -> StageId {
        self.record.id
    }

    pub fn root_id(&self) -> StageId {
        self.record.root_id
    }

    pub fn parent_id(&self) -> Option<StageId> {
        self.record.parent_id
    }

    pub fn kind(&self) -> &str {
        &self.record.kind
    }

    pub fn args(&self) -> &[Value] {
        &self.record.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.record.args.get(index)
    }

    /// Deserialize a positional argument. A missing or mistyped argument is
    /// fatal: retrying cannot fix it.
    pub fn arg_as<T: DeserializeOwned>(&self, index: usize) -> Result<T, StageError> {
        let value = self
            .arg(index)
            .ok_or_else(|| StageError::Abort(format!("missing argument {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| StageError::Abort(format!("argument {index}: {e}")))
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.record.kwargs
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.record.kwargs.get(name)
    }

    pub fn kwarg_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, StageError> {
        let value = self
            .kwarg(name)
            .ok_or_else(|| StageError::Abort(format!("missing keyword argument '{name}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| StageError::Abort(format!("keyword argument '{name}': {e}")))
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    pub fn attempt(&self) -> u32 {
        self.record.attempt
    }

    /// Index of the continuation step being run.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub(crate) fn set_step(&mut self, step: u32) {
        self.step = step;
    }

    pub fn outputs(&mut self) -> &mut OutputHandles<'a> {
        &mut self.outputs
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    /// Declare a child stage of kind `kind`.
    ///
    /// The child's identity is derived from this stage's identity and the
    /// declaration position. Its record is created once every future it
    /// consumes is resolved and every sibling it is ordered after has
    /// completed.
    pub fn spawn(&mut self, kind: &str, spec: ChildSpec) -> Result<ChildHandle, StageError> {
        let logic = self.registry.get(kind)?;

        for arg in spec.args.iter().chain(spec.kwargs.values()) {
            if let Arg::Future(slot) = arg {
                if !self.knows_slot(slot) {
                    return Err(StageError::UnknownFuture(slot.clone()));
                }
            }
        }

        let mut after = self.ordering.edges();
        for dep in spec.after {
            if self.find_child(&dep).is_none() {
                return Err(StageError::UnknownFuture(SlotRef::default_of(dep)));
            }
            after.insert(dep);
        }

        let mut output_names = vec![DEFAULT_OUTPUT.to_string()];
        let extra = logic
            .output_names()
            .iter()
            .map(|name| name.to_string())
            .chain(spec.outputs);
        for name in extra {
            if !output_names.contains(&name) {
                output_names.push(name);
            }
        }

        let position = (self.record.children.len() + self.declared.len()) as u32;
        let decl = ChildDeclaration {
            id: identity::assign(self.record.id, position),
            position,
            kind: kind.to_string(),
            args: spec.args,
            kwargs: spec.kwargs,
            output_names,
            after,
            queue: spec.queue,
            retry: spec.retry,
            inherited_outputs: Default::default(),
            materialized: false,
        };
        let handle = ChildHandle::from_declaration(&decl);
        self.ordering.record_declared(decl.id);
        self.declared.push(decl);
        Ok(handle)
    }

    /// Every child declared so far, in declaration order.
    pub fn children(&self) -> Vec<ChildHandle> {
        self.record
            .children
            .iter()
            .chain(&self.declared)
            .map(ChildHandle::from_declaration)
            .collect()
    }

    pub fn child(&self, position: u32) -> Option<ChildHandle> {
        self.record
            .children
            .iter()
            .chain(&self.declared)
            .find(|decl| decl.position == position)
            .map(ChildHandle::from_declaration)
    }

    /// Resolved value of a child's output, if it has been filled.
    pub fn value(&self, slot: &SlotRef) -> Option<&Value> {
        self.record.resolved.get(slot)
    }

    /// Resolved value of a child's `default` output.
    pub fn value_of(&self, child: &ChildHandle) -> Option<&Value> {
        self.value(&child.default_output())
    }

    pub(crate) fn find_child(&self, id: &StageId) -> Option<&ChildDeclaration> {
        self.record
            .children
            .iter()
            .chain(&self.declared)
            .find(|decl| decl.id == *id)
    }

    pub(crate) fn knows_slot(&self, slot: &SlotRef) -> bool {
        self.find_child(&slot.stage_id)
            .is_some_and(|decl| decl.declares_output(&slot.name))
    }

    // -----------------------------------------------------------------------
    // Scratch state
    // -----------------------------------------------------------------------

    /// Values carried between continuation steps.
    pub fn locals(&self) -> &Map<String, Value> {
        &self.locals
    }

    pub fn locals_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.locals
    }

    // -----------------------------------------------------------------------
    // Ordering scopes
    // -----------------------------------------------------------------------

    /// Open a scope whose declarations wait for every child in `deps`.
    pub fn after<'h>(
        &mut self,
        deps: impl IntoIterator<Item = &'h ChildHandle>,
    ) -> Result<(), StageError> {
        let mut ids = Vec::new();
        for dep in deps {
            if self.find_child(&dep.id()).is_none() {
                return Err(StageError::UnknownFuture(dep.default_output()));
            }
            ids.push(dep.id());
        }
        self.ordering.push_after(ids);
        Ok(())
    }

    /// Open a scope whose declarations run strictly one after another.
    pub fn in_order(&mut self) -> Result<(), StageError> {
        self.ordering.push_in_order()
    }

    /// Close the innermost ordering scope.
    pub fn end_scope(&mut self) -> Result<(), StageError> {
        self.ordering.pop().map(|_| ())
    }

    pub fn with_after<'h, T>(
        &mut self,
        deps: impl IntoIterator<Item = &'h ChildHandle>,
        body: impl FnOnce(&mut Self) -> Result<T, StageError>,
    ) -> Result<T, StageError> {
        self.after(deps)?;
        let out = body(self)?;
        self.end_scope()?;
        Ok(out)
    }

    pub fn with_in_order<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, StageError>,
    ) -> Result<T, StageError> {
        self.in_order()?;
        let out = body(self)?;
        self.end_scope()?;
        Ok(out)
    }

    pub(crate) fn into_effects(self) -> ContextEffects {
        ContextEffects {
            fills: self.outputs.into_staged(),
            declared: self.declared,
            ordering: self.ordering,
            locals: self.locals,
        }
    }
}

// ---------------------------------------------------------------------------
// FinalizeContext
// ---------------------------------------------------------------------------

/// Read-only view of a stage for its finalize and abort hooks.
pub struct FinalizeContext<'a> {
    record: &'a StageRecord,
}

impl<'a> FinalizeContext<'a> {
    pub(crate) fn new(record: &'a StageRecord) -> Self {
        Self { record }
    }

    pub fn id(&self) -> StageId {
        self.record.id
    }

    pub fn root_id(&self) -> StageId {
        self.record.root_id
    }

    pub fn parent_id(&self) -> Option<StageId> {
        self.record.parent_id
    }

    pub fn kind(&self) -> &str {
        &self.record.kind
    }

    pub fn args(&self) -> &[Value] {
        &self.record.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.record.kwargs
    }

    pub fn attempt(&self) -> u32 {
        self.record.attempt
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.record.output(name)
    }

    pub fn outputs(&self) -> BTreeMap<String, Value> {
        self.record.filled_outputs()
    }

    pub fn was_aborted(&self) -> bool {
        self.record.state == StageState::Aborted
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.record.abort_reason.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.record.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pipewright_types::stage::NewStage;
    use serde_json::json;

    use super::*;
    use crate::logic::{Outcome, StageLogic};

    struct Leaf;

    impl StageLogic for Leaf {
        fn run(&self, _ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
            Ok(Outcome::Done)
        }
    }

    struct Split;

    impl StageLogic for Split {
        fn run(&self, _ctx: &mut StageContext<'_>) -> Result<Outcome, StageError> {
            Ok(Outcome::Done)
        }

        fn output_names(&self) -> &[&str] {
            &["left", "right"]
        }
    }

    fn registry() -> StageRegistry {
        StageRegistry::new().with("leaf", Leaf).with("split", Split)
    }

    fn record() -> StageRecord {
        let id = identity::new_root();
        StageRecord::new(NewStage {
            id,
            root_id: id,
            parent_id: None,
            kind: "parent".to_string(),
            args: vec![json!(["a", "bb"]), json!(3)],
            kwargs: BTreeMap::from([("mode".to_string(), json!("fast"))]),
            output_names: Vec::new(),
            inherited_outputs: BTreeSet::new(),
            retry: RetryPolicy::default(),
            queue: "default".to_string(),
        })
    }

    #[test]
    fn exposes_arguments() {
        let rec = record();
        let registry = registry();
        let ctx = StageContext::new(&rec, &registry);
        assert_eq!(ctx.arg_as::<Vec<String>>(0).unwrap(), vec!["a", "bb"]);
        assert_eq!(ctx.arg_as::<u64>(1).unwrap(), 3);
        assert!(ctx.arg_as::<u64>(0).unwrap_err().is_fatal());
        assert!(ctx.arg_as::<u64>(9).is_err());
        assert_eq!(ctx.kwarg_as::<String>("mode").unwrap(), "fast");
        assert_eq!(ctx.step(), 0);
        assert_eq!(ctx.attempt(), 1);
    }

    #[test]
    fn spawn_assigns_positional_identities() {
        let rec = record();
        let registry = registry();
        let mut ctx = StageContext::new(&rec, &registry);

        let a = ctx.spawn("leaf", ChildSpec::new().arg(json!(1))).unwrap();
        let b = ctx.spawn("leaf", ChildSpec::new().arg(&a)).unwrap();

        assert_eq!(a.id(), identity::assign(rec.id, 0));
        assert_eq!(b.id(), identity::assign(rec.id, 1));
        assert_eq!(ctx.children().len(), 2);
        assert_eq!(ctx.child(1), Some(b));
    }

    #[test]
    fn spawn_rejects_unknown_kind_and_foreign_futures() {
        let rec = record();
        let registry = registry();
        let mut ctx = StageContext::new(&rec, &registry);

        assert_eq!(
            ctx.spawn("nope", ChildSpec::new()).unwrap_err(),
            StageError::UnknownStageKind("nope".to_string())
        );

        let foreign = SlotRef::default_of(identity::new_root());
        assert!(matches!(
            ctx.spawn("leaf", ChildSpec::new().arg(foreign)),
            Err(StageError::UnknownFuture(_))
        ));
    }

    #[test]
    fn named_outputs_come_from_logic_and_spec() {
        let rec = record();
        let registry = registry();
        let mut ctx = StageContext::new(&rec, &registry);

        let split = ctx.spawn("split", ChildSpec::new().output("extra")).unwrap();
        assert!(split.output("left").is_ok());
        assert!(split.output("extra").is_ok());
        assert_eq!(
            split.output("middle"),
            Err(StageError::UndeclaredOutput("middle".to_string()))
        );

        let consumer = ctx
            .spawn("leaf", ChildSpec::new().arg(split.output("right").unwrap()))
            .unwrap();
        let effects = ctx.into_effects();
        let decl = effects
            .declared
            .iter()
            .find(|d| d.id == consumer.id())
            .unwrap();
        assert_eq!(decl.barrier().len(), 1);
    }

    #[test]
    fn in_order_scope_adds_edges() {
        let rec = record();
        let registry = registry();
        let mut ctx = StageContext::new(&rec, &registry);

        let (first, second) = ctx
            .with_in_order(|ctx| {
                let first = ctx.spawn("leaf", ChildSpec::new())?;
                let second = ctx.spawn("leaf", ChildSpec::new())?;
                Ok((first, second))
            })
            .unwrap();
        let free = ctx.spawn("leaf", ChildSpec::new()).unwrap();

        let effects = ctx.into_effects();
        let after_of = |id: StageId| {
            effects
                .declared
                .iter()
                .find(|d| d.id == id)
                .map(|d| d.after.clone())
                .unwrap()
        };
        assert!(after_of(first.id()).is_empty());
        assert_eq!(after_of(second.id()), BTreeSet::from([first.id()]));
        assert!(after_of(free.id()).is_empty());
        assert_eq!(effects.ordering.depth(), 0);
    }

    #[test]
    fn after_scope_rejects_strangers() {
        let rec = record();
        let registry = registry();
        let mut ctx = StageContext::new(&rec, &registry);
        let other_rec = record();
        let mut other = StageContext::new(&other_rec, &registry);
        let stranger = other.spawn("leaf", ChildSpec::new()).unwrap();

        assert!(matches!(
            ctx.after([&stranger]),
            Err(StageError::UnknownFuture(_))
        ));
        assert_eq!(ctx.end_scope(), Err(StageError::OrderingUnderflow));
    }

    #[test]
    fn finalize_context_reads_outputs() {
        let mut rec = record();
        crate::slots::fill(&mut rec, DEFAULT_OUTPUT, json!(9));
        let ctx = FinalizeContext::new(&rec);
        assert_eq!(ctx.output(DEFAULT_OUTPUT), Some(&json!(9)));
        assert_eq!(ctx.outputs().len(), 1);
        assert!(!ctx.was_aborted());
    }
}
