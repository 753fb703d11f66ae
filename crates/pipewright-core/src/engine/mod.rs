//! The stage state machine.
//!
//! `Engine` owns no threads. Work arrives as [`Dispatch`]es through
//! [`Engine::handle`] (from whatever worker drains the scheduler) and as
//! resumption signals through [`Engine::resume`]. Every state transition
//! is a compare-and-swap against the [`StageStore`], re-read and re-applied
//! on conflict, so any number of workers can drive the same tree.
//!
//! ```text
//! Created -> Ready -> Running -> Completed -> Finalizing -> Finalized
//!                        |  ^
//!                        v  |
//!                  AsyncSuspended
//!
//! any non-terminal state -> Retrying -> Ready   (recoverable failure)
//! any non-terminal state -> Aborted             (fatal failure / abort)
//! ```

mod abort;
mod execute;
mod finalize;
mod propagate;
mod resume;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pipewright_types::config::EngineConfig;
use pipewright_types::dispatch::{Ack, Dispatch, DispatchToken, TaskKind};
use pipewright_types::error::StoreError;
use pipewright_types::event::StageEvent;
use pipewright_types::stage::{NewStage, RetryPolicy, StageId, StageRecord, StageState};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::event::EventBus;
use crate::identity;
use crate::logic::{StageError, StageRegistry};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::StageStore;

/// Conflicting writes tolerated for one transition before giving up.
const MAX_WRITE_ATTEMPTS: u32 = 32;

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Errors from driving the state machine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("stage not found: {0}")]
    NotFound(StageId),

    #[error("unknown stage kind '{0}'")]
    UnknownStageKind(String),

    #[error("gave up on stage {0} after repeated write conflicts")]
    Contention(StageId),
}

/// Errors returned to the sender of a resumption signal.
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("no suspended stage {0}")]
    UnknownStage(StageId),

    #[error("caller may not resume stage {0}")]
    Forbidden(StageId),

    #[error("stage {0} is already being resumed")]
    InProgress(StageId),

    #[error("callback for stage {stage_id} failed: {error}")]
    Callback { stage_id: StageId, error: StageError },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<StoreError> for ResumeError {
    fn from(err: StoreError) -> Self {
        ResumeError::Engine(EngineError::Store(err))
    }
}

/// What `handle` did with a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The dispatch was executed; the stage is now in this state.
    Applied(StageState),
    /// The work was already done or claimed elsewhere; nothing happened.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    Resumed(StageState),
    /// The stage had already completed; the signal was ignored.
    AlreadyCompleted,
}

/// Stages moved to `Aborted` by one abort call. Empty when repeated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbortResult {
    pub aborted: Vec<StageId>,
}

// ---------------------------------------------------------------------------
// StartOptions
// ---------------------------------------------------------------------------

/// Inputs and options for a root stage.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub queue: Option<String>,
    pub retry: Option<RetryPolicy>,
    /// Makes the root identity deterministic; starting twice with the same
    /// key returns the existing root.
    pub idempotence_key: Option<String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
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

    pub fn idempotence_key(mut self, key: impl Into<String>) -> Self {
        self.idempotence_key = Some(key.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Outcome of a record transition closure.
pub(crate) enum Mutation<T> {
    /// Persist the modified record.
    Write(T),
    /// Leave the record untouched.
    Skip(T),
}

/// Drives stage trees to completion over a store and a scheduler.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct Engine<S, Q> {
    store: S,
    scheduler: Q,
    registry: StageRegistry,
    events: EventBus,
    config: EngineConfig,
}

impl<S: StageStore, Q: Scheduler> Engine<S, Q> {
    pub fn new(store: S, scheduler: Q, registry: StageRegistry, config: EngineConfig) -> Self {
        Self {
            store,
            scheduler,
            registry,
            events: EventBus::new(config.event_capacity),
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn scheduler(&self) -> &Q {
        &self.scheduler
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    /// Create a root stage and enqueue its first run.
    #[tracing::instrument(name = "start_workflow", skip_all, fields(kind = %kind))]
    pub async fn start(&self, kind: &str, options: StartOptions) -> Result<StageId, EngineError> {
        let logic = self
            .registry
            .get(kind)
            .map_err(|_| EngineError::UnknownStageKind(kind.to_string()))?;

        let id = match &options.idempotence_key {
            Some(key) => identity::root_from_key(key),
            None => identity::new_root(),
        };
        let record = StageRecord::new(NewStage {
            id,
            root_id: id,
            parent_id: None,
            kind: kind.to_string(),
            args: options.args,
            kwargs: options.kwargs,
            output_names: logic.output_names().iter().map(|n| n.to_string()).collect(),
            inherited_outputs: Default::default(),
            retry: options.retry.unwrap_or_else(|| self.config.retry.clone()),
            queue: options.queue.unwrap_or_else(|| self.config.default_queue.clone()),
        });

        if self.insert(record).await? {
            tracing::info!(root_id = %id, kind = %kind, "workflow started");
        } else {
            tracing::debug!(root_id = %id, "workflow already exists for idempotence key");
        }
        self.make_ready(id).await?;
        Ok(id)
    }

    /// Worker entry point for one dispatch.
    #[tracing::instrument(
        name = "handle_dispatch",
        skip_all,
        fields(token = %dispatch.token, queue = %dispatch.queue)
    )]
    pub async fn handle(&self, dispatch: Dispatch) -> Result<HandleOutcome, EngineError> {
        match dispatch.token.kind {
            TaskKind::Run | TaskKind::Evaluate => self.execute(dispatch.token).await,
            TaskKind::Finalize => self.finalize(dispatch.token).await,
        }
    }

    pub async fn get(&self, id: StageId) -> Result<Option<StageRecord>, EngineError> {
        Ok(self.store.get(&id).await?)
    }

    /// Filled outputs of a stage, keyed by slot name.
    pub async fn outputs(&self, id: StageId) -> Result<BTreeMap<String, Value>, EngineError> {
        let record = self.load(id).await?;
        Ok(record.filled_outputs())
    }

    /// Every record of the tree rooted at `root_id`.
    pub async fn tree(&self, root_id: StageId) -> Result<Vec<StageRecord>, EngineError> {
        Ok(self.store.list_tree(&root_id).await?)
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    async fn load(&self, id: StageId) -> Result<StageRecord, EngineError> {
        self.store.get(&id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Read-modify-write with optimistic concurrency.
    ///
    /// `apply` may run several times against fresh reads; it must not have
    /// side effects beyond the record. On `Skip` the record as read is
    /// returned.
    pub(crate) async fn mutate<T>(
        &self,
        id: StageId,
        mut apply: impl FnMut(&mut StageRecord) -> Mutation<T>,
    ) -> Result<(StageRecord, T), EngineError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.load(id).await?;
            let mut next = current.clone();
            match apply(&mut next) {
                Mutation::Skip(out) => return Ok((current, out)),
                Mutation::Write(out) => {
                    next.version = current.version + 1;
                    next.updated_at = Utc::now();
                    match self.store.compare_and_swap(&next, current.version).await {
                        Ok(()) => return Ok((next, out)),
                        Err(err) if err.is_conflict() => {
                            tracing::debug!(stage_id = %id, version = current.version, "write conflict, retrying");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Err(EngineError::Contention(id))
    }

    /// Insert a fresh record. Returns `false` if it already existed.
    async fn insert(&self, mut record: StageRecord) -> Result<bool, EngineError> {
        record.version = 1;
        match self.store.compare_and_swap(&record, 0).await {
            Ok(()) => {
                self.events.publish(StageEvent::Created {
                    stage_id: record.id,
                    root_id: record.root_id,
                    parent_id: record.parent_id,
                    kind: record.kind.clone(),
                });
                tracing::debug!(stage_id = %record.id, kind = %record.kind, "stage created");
                Ok(true)
            }
            Err(err) if err.is_conflict() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// `Created -> Ready`, then enqueue the run. Safe to repeat.
    async fn make_ready(&self, id: StageId) -> Result<(), EngineError> {
        let (record, became_ready) = self
            .mutate(id, |rec| {
                if rec.state == StageState::Created {
                    rec.state = StageState::Ready;
                    Mutation::Write(true)
                } else {
                    Mutation::Skip(false)
                }
            })
            .await?;

        if let Some(parent_id) = record.parent_id {
            let parent = self.load(parent_id).await?;
            if parent.state == StageState::Aborted {
                let reason = parent
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| "parent aborted".to_string());
                self.abort_one(id, &reason).await?;
                return Ok(());
            }
        }

        if became_ready {
            self.events.publish(StageEvent::Ready {
                stage_id: id,
                root_id: record.root_id,
                attempt: record.attempt,
            });
        }
        if record.state == StageState::Ready {
            self.enqueue(DispatchToken::run(id, record.attempt), None, &record.queue)
                .await?;
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        token: DispatchToken,
        not_before: Option<DateTime<Utc>>,
        queue: &str,
    ) -> Result<(), EngineError> {
        let ack = self
            .scheduler
            .enqueue(Dispatch {
                token,
                not_before,
                queue: queue.to_string(),
            })
            .await?;
        if ack == Ack::Duplicate {
            tracing::debug!(token = %token, "dispatch already enqueued");
        }
        Ok(())
    }

    fn publish_all(&self, events: Vec<StageEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }
}
