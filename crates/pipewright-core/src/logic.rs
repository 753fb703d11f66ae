//! The stage logic trait and the registry that maps stage kinds to it.
//!
//! Stage logic is plain synchronous code. A stage that needs to wait (for
//! a child's output or an external signal) returns an [`Outcome`] that tells
//! the engine to park it; the engine persists the continuation state and
//! calls back into the logic when the wait is over.

use std::collections::HashMap;
use std::sync::Arc;

use pipewright_types::stage::{CallbackAccess, SlotRef};
use serde_json::Value;

use crate::context::{ChildHandle, FinalizeContext, StageContext};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a continuation step asks the engine to do next.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Fill `default` with the value and complete.
    Complete(Value),
    /// Complete; `default` is filled with `null` unless the step filled it.
    Done,
    /// Park until an external resumption signal arrives.
    Suspend,
    /// Run the next step once every listed future is resolved.
    Await(Vec<SlotRef>),
    /// Complete, handing every unfilled output to the given child.
    Delegate(ChildHandle),
}

impl Outcome {
    /// Await a set of child handles' `default` outputs.
    pub fn await_children<'a>(children: impl IntoIterator<Item = &'a ChildHandle>) -> Self {
        Outcome::Await(children.into_iter().map(ChildHandle::default_output).collect())
    }
}

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

/// A failure raised by stage logic or detected by the engine while running it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    /// Recoverable: try again after backoff.
    #[error("retry requested: {0}")]
    Retry(String),

    /// Recoverable failure.
    #[error("stage failed: {0}")]
    Failed(String),

    /// Fatal: abort the workflow.
    #[error("stage aborted: {0}")]
    Abort(String),

    #[error("output '{0}' is not declared by this stage")]
    UndeclaredOutput(String),

    #[error("output '{0}' was already filled")]
    SlotAlreadyFilled(String),

    #[error("future {0} does not belong to a child of this stage")]
    UnknownFuture(SlotRef),

    #[error("in_order scopes cannot be nested")]
    NestedInOrder,

    #[error("end_scope called with no open ordering scope")]
    OrderingUnderflow,

    #[error("invalid delegation: {0}")]
    DelegationMismatch(String),

    #[error("stage completed without filling outputs: {}", .0.join(", "))]
    OutputsNotFilled(Vec<String>),

    #[error("unknown stage kind '{0}'")]
    UnknownStageKind(String),
}

impl StageError {
    /// Only `Retry` and `Failed` are eligible for another attempt.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StageError::Retry(_) | StageError::Failed(_))
    }
}

// ---------------------------------------------------------------------------
// StageLogic
// ---------------------------------------------------------------------------

/// User logic for one stage kind.
///
/// `run` is called once per continuation step; `ctx.step()` says which.
/// Everything the logic needs comes from the context; there is no ambient
/// lookup.
pub trait StageLogic: Send + Sync + 'static {
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Outcome, StageError>;

    /// Handle an external resumption signal for a suspended stage.
    fn callback(&self, ctx: &mut StageContext<'_>, payload: &Value) -> Result<Outcome, StageError> {
        let _ = (ctx, payload);
        Err(StageError::Abort("stage does not accept callbacks".to_string()))
    }

    /// Cleanup hook; called exactly once after every output is filled.
    fn finalize(&self, ctx: &FinalizeContext<'_>) -> Result<(), StageError> {
        let _ = ctx;
        Ok(())
    }

    /// Called once when the stage is aborted.
    fn aborted(&self, ctx: &FinalizeContext<'_>) {
        let _ = ctx;
    }

    /// Who may deliver resumption signals to this kind.
    fn callback_access(&self) -> CallbackAccess {
        CallbackAccess::Internal
    }

    /// Named outputs besides `default`.
    fn output_names(&self) -> &[&str] {
        &[]
    }
}

// ---------------------------------------------------------------------------
// StageRegistry
// ---------------------------------------------------------------------------

/// Maps stage kind names to their logic.
#[derive(Clone, Default)]
pub struct StageRegistry {
    kinds: HashMap<String, Arc<dyn StageLogic>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register logic under `kind`, replacing any previous registration.
    pub fn register(&mut self, kind: impl Into<String>, logic: impl StageLogic) -> &mut Self {
        self.kinds.insert(kind.into(), Arc::new(logic));
        self
    }

    pub fn with(mut self, kind: impl Into<String>, logic: impl StageLogic) -> Self {
        self.register(kind, logic);
        self
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn StageLogic>, StageError> {
        self.kinds
            .get(kind)
            .cloned()
            .ok_or_else(|| StageError::UnknownStageKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
