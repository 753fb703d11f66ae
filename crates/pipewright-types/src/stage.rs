//! Stage domain types.
//!
//! A workflow is a tree of stages. Each stage is persisted as a
//! [`StageRecord`] holding its arguments, output slots, lifecycle state and
//! the resumable continuation state ([`Cursor`]) of its logic. Children a
//! stage declares are kept on the parent as [`ChildDeclaration`]s until the
//! futures they consume are resolved.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Name of the output slot every stage owns.
pub const DEFAULT_OUTPUT: &str = "default";

// ---------------------------------------------------------------------------
// StageId
// ---------------------------------------------------------------------------

/// Globally unique, stable stage identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub Uuid);

impl StageId {
    /// First eight hex characters, for compact display.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(StageId)
    }
}

// ---------------------------------------------------------------------------
// SlotRef (future)
// ---------------------------------------------------------------------------

/// A read handle to one output slot of one stage.
///
/// Serialized as `"<stage-uuid>/<slot-name>"` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotRef {
    pub stage_id: StageId,
    pub name: String,
}

impl SlotRef {
    /// The `default` slot of a stage.
    pub fn default_of(stage_id: StageId) -> Self {
        Self {
            stage_id,
            name: DEFAULT_OUTPUT.to_string(),
        }
    }

    /// A named slot of a stage.
    pub fn named(stage_id: StageId, name: impl Into<String>) -> Self {
        Self {
            stage_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage_id, self.name)
    }
}

/// Failure to parse a serialized [`SlotRef`].
#[derive(Debug, thiserror::Error)]
#[error("invalid slot reference '{0}'")]
pub struct SlotRefParseError(pub String);

impl TryFrom<String> for SlotRef {
    type Error = SlotRefParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (id, name) = value
            .split_once('/')
            .ok_or_else(|| SlotRefParseError(value.clone()))?;
        if name.is_empty() {
            return Err(SlotRefParseError(value));
        }
        let stage_id = id
            .parse::<StageId>()
            .map_err(|_| SlotRefParseError(value.clone()))?;
        Ok(Self {
            stage_id,
            name: name.to_string(),
        })
    }
}

impl From<SlotRef> for String {
    fn from(slot: SlotRef) -> Self {
        slot.to_string()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Created,
    Ready,
    Running,
    AsyncSuspended,
    Completed,
    Finalizing,
    Finalized,
    Retrying,
    Aborted,
}

impl StageState {
    /// `Finalized` and `Aborted` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Finalized | StageState::Aborted)
    }

    /// The stage's logic has finished (it may still await inherited outputs).
    pub fn has_completed(self) -> bool {
        matches!(
            self,
            StageState::Completed | StageState::Finalizing | StageState::Finalized
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Created => "created",
            StageState::Ready => "ready",
            StageState::Running => "running",
            StageState::AsyncSuspended => "async_suspended",
            StageState::Completed => "completed",
            StageState::Finalizing => "finalizing",
            StageState::Finalized => "finalized",
            StageState::Retrying => "retrying",
            StageState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("invalid stage state: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Output slots
// ---------------------------------------------------------------------------

/// A named, write-once value container owned by one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub name: String,
    pub filled: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_at: Option<DateTime<Utc>>,
}

impl OutputSlot {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filled: false,
            value: Value::Null,
            filled_at: None,
        }
    }

    /// The value, if the slot has been filled.
    pub fn get(&self) -> Option<&Value> {
        self.filled.then_some(&self.value)
    }
}

// ---------------------------------------------------------------------------
// Access control for resumption signals
// ---------------------------------------------------------------------------

/// Who may deliver a resumption signal to a stage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAccess {
    /// Anyone who knows the stage identity.
    Public,
    /// Authenticated (signed or bearer) callers and in-process callers.
    Privileged,
    /// In-process callers only.
    #[default]
    Internal,
}

/// Authentication level of the party delivering a resumption signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caller {
    Anonymous,
    Privileged,
    Internal,
}

impl CallbackAccess {
    pub fn permits(self, caller: Caller) -> bool {
        match self {
            CallbackAccess::Public => true,
            CallbackAccess::Privileged => matches!(caller, Caller::Privileged | Caller::Internal),
            CallbackAccess::Internal => caller == Caller::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Attempt limit and exponential backoff for recoverable failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in seconds (default 15).
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
    /// Multiplier applied to the delay for each further attempt (default 2).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_seconds() -> u64 {
    15
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

// ---------------------------------------------------------------------------
// Child declarations and continuation state
// ---------------------------------------------------------------------------

/// An input argument of a declared child: a literal or a future.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    Value(Value),
    Future(SlotRef),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<SlotRef> for Arg {
    fn from(slot: SlotRef) -> Self {
        Arg::Future(slot)
    }
}

/// A child stage declared by its parent's continuation logic.
///
/// The child's record is created only once every slot in [`barrier`] is
/// resolved in the parent's `resolved` table.
///
/// [`barrier`]: ChildDeclaration::barrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildDeclaration {
    pub id: StageId,
    /// Declaration order within the parent (the identity input).
    pub position: u32,
    pub kind: String,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Arg>,
    /// Declared outputs, `default` included.
    pub output_names: Vec<String>,
    /// Ordering edges: siblings that must complete first.
    #[serde(default)]
    pub after: BTreeSet<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Parent outputs this child fills on the parent's behalf.
    #[serde(default)]
    pub inherited_outputs: BTreeSet<String>,
    #[serde(default)]
    pub materialized: bool,
}

impl ChildDeclaration {
    /// Every slot that must be resolved before the child may be created.
    pub fn barrier(&self) -> BTreeSet<SlotRef> {
        let futures = self
            .args
            .iter()
            .chain(self.kwargs.values())
            .filter_map(|arg| match arg {
                Arg::Future(slot) => Some(slot.clone()),
                Arg::Value(_) => None,
            });
        let edges = self.after.iter().map(|id| SlotRef::default_of(*id));
        futures.chain(edges).collect()
    }

    pub fn declares_output(&self, name: &str) -> bool {
        self.output_names.iter().any(|n| n == name)
    }
}

/// One entry of the persisted ordering-operator stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderingFrame {
    /// Declarations wait for every listed sibling.
    After { deps: BTreeSet<StageId> },
    /// Declarations wait for the previous declaration in the same block.
    InOrder {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last: Option<StageId>,
    },
}

/// Where a stage's continuation logic resumes next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Index of the next step to run.
    pub step: u32,
    /// Futures the next step waits on.
    #[serde(default)]
    pub blocked_on: Vec<SlotRef>,
    #[serde(default)]
    pub ordering: Vec<OrderingFrame>,
    /// Scratch values the logic carries between steps.
    #[serde(default)]
    pub locals: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// StageRecord
// ---------------------------------------------------------------------------

/// The durable record of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: StageId,
    pub root_id: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<StageId>,
    /// Registry key of the stage logic.
    pub kind: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
    /// Declared outputs, `default` included.
    pub output_names: Vec<String>,
    /// Outputs aliased to the parent's slots by tail-delegation.
    #[serde(default)]
    pub inherited_outputs: BTreeSet<String>,
    pub slots: BTreeMap<String, OutputSlot>,
    pub state: StageState,
    /// 1-based attempt number.
    pub attempt: u32,
    pub retry: RetryPolicy,
    pub queue: String,
    #[serde(default)]
    pub cursor: Cursor,
    #[serde(default)]
    pub children: Vec<ChildDeclaration>,
    /// Resolved values of the children's slots.
    #[serde(default)]
    pub resolved: BTreeMap<SlotRef, Value>,
    /// Child whose outputs fill this stage's unfilled outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<StageId>,
    /// Dispatch token currently executing this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Optimistic concurrency version; 1 on first insert.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Everything needed to create a fresh record.
#[derive(Debug, Clone)]
pub struct NewStage {
    pub id: StageId,
    pub root_id: StageId,
    pub parent_id: Option<StageId>,
    pub kind: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub output_names: Vec<String>,
    pub inherited_outputs: BTreeSet<String>,
    pub retry: RetryPolicy,
    pub queue: String,
}

impl StageRecord {
    /// Build a record in the `Created` state with empty output slots.
    ///
    /// `default` is always declared, whether or not `output_names` lists it.
    pub fn new(stage: NewStage) -> Self {
        let mut output_names = vec![DEFAULT_OUTPUT.to_string()];
        for name in stage.output_names {
            if !output_names.contains(&name) {
                output_names.push(name);
            }
        }
        let slots = output_names
            .iter()
            .map(|name| (name.clone(), OutputSlot::empty(name.clone())))
            .collect();
        let now = Utc::now();

        Self {
            id: stage.id,
            root_id: stage.root_id,
            parent_id: stage.parent_id,
            kind: stage.kind,
            args: stage.args,
            kwargs: stage.kwargs,
            output_names,
            inherited_outputs: stage.inherited_outputs,
            slots,
            state: StageState::Created,
            attempt: 1,
            retry: stage.retry,
            queue: stage.queue,
            cursor: Cursor::default(),
            children: Vec::new(),
            resolved: BTreeMap::new(),
            delegate: None,
            claim: None,
            last_error: None,
            abort_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn declares_output(&self, name: &str) -> bool {
        self.output_names.iter().any(|n| n == name)
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.slots.get(name).and_then(OutputSlot::get)
    }

    /// Values of every filled slot, keyed by slot name.
    pub fn filled_outputs(&self) -> BTreeMap<String, Value> {
        self.slots
            .values()
            .filter(|slot| slot.filled)
            .map(|slot| (slot.name.clone(), slot.value.clone()))
            .collect()
    }

    /// Names of declared slots that are still empty.
    pub fn unfilled_outputs(&self) -> BTreeSet<String> {
        self.slots
            .values()
            .filter(|slot| !slot.filled)
            .map(|slot| slot.name.clone())
            .collect()
    }

    pub fn all_outputs_filled(&self) -> bool {
        self.slots.values().all(|slot| slot.filled)
    }

    /// Every declared child has filled its `default` slot.
    pub fn children_completed(&self) -> bool {
        self.children
            .iter()
            .all(|child| self.resolved.contains_key(&SlotRef::default_of(child.id)))
    }

    pub fn child(&self, id: &StageId) -> Option<&ChildDeclaration> {
        self.children.iter().find(|child| child.id == *id)
    }

    /// All futures the current continuation step waits on are resolved.
    pub fn blocked_futures_resolved(&self) -> bool {
        self.cursor
            .blocked_on
            .iter()
            .all(|slot| self.resolved.contains_key(slot))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
