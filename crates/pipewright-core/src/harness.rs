//! Synchronous test harness.
//!
//! Drives the real state machine over a store (in-memory unless one is
//! supplied) and an inline scheduler: every dispatch is executed on the
//! calling task, in FIFO order by default. `shuffled` drains newest-first
//! instead, `with_duplicate_delivery` hands every dispatch to the engine
//! twice, and `redelivering` hands a dispatch whose handling failed back to
//! the engine the way the worker pool does.

use std::collections::BTreeMap;
use std::sync::Mutex;

use pipewright_types::config::EngineConfig;
use pipewright_types::dispatch::Dispatch;
use pipewright_types::event::StageEvent;
use pipewright_types::stage::{Caller, DEFAULT_OUTPUT, StageId, StageRecord};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::engine::{AbortResult, Engine, EngineError, ResumeError, ResumeResult, StartOptions};
use crate::logic::StageRegistry;
use crate::scheduler::InlineScheduler;
use crate::store::{InMemoryStageStore, StageStore};

/// Dispatches executed by one `run_until_idle` call before it gives up.
const MAX_DISPATCHES: usize = 100_000;

/// Redeliveries of one failed dispatch in `redelivering` mode.
const MAX_REDELIVERIES: usize = 5;

const HARNESS_EVENT_CAPACITY: usize = 65_536;

pub struct TestHarness<S = InMemoryStageStore> {
    engine: Engine<S, InlineScheduler>,
    receiver: Mutex<broadcast::Receiver<StageEvent>>,
    seen: Mutex<Vec<StageEvent>>,
    shuffle: bool,
    duplicate_delivery: bool,
    redeliver: bool,
    redelivered: Mutex<usize>,
}

impl TestHarness<InMemoryStageStore> {
    pub fn new(registry: StageRegistry) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: StageRegistry, config: EngineConfig) -> Self {
        Self::with_store(InMemoryStageStore::new(), registry, config)
    }
}

impl<S: StageStore> TestHarness<S> {
    pub fn with_store(store: S, registry: StageRegistry, mut config: EngineConfig) -> Self {
        config.event_capacity = config.event_capacity.max(HARNESS_EVENT_CAPACITY);
        let engine = Engine::new(store, InlineScheduler::new(), registry, config);
        let receiver = Mutex::new(engine.subscribe());
        Self {
            engine,
            receiver,
            seen: Mutex::new(Vec::new()),
            shuffle: false,
            duplicate_delivery: false,
            redeliver: false,
            redelivered: Mutex::new(0),
        }
    }

    /// Drain the newest dispatch first.
    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    /// Deliver every dispatch twice.
    pub fn with_duplicate_delivery(mut self) -> Self {
        self.duplicate_delivery = true;
        self
    }

    /// Hand a dispatch whose handling failed to the engine again, up to
    /// five times, instead of returning the error.
    pub fn redelivering(mut self) -> Self {
        self.redeliver = true;
        self
    }

    /// Dispatches handed back after a failure so far.
    pub fn redelivered(&self) -> usize {
        *self
            .redelivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn engine(&self) -> &Engine<S, InlineScheduler> {
        &self.engine
    }

    pub async fn start(&self, kind: &str, options: StartOptions) -> Result<StageId, EngineError> {
        self.engine.start(kind, options).await
    }

    /// Start a root and drive it until nothing is left to do.
    pub async fn run(&self, kind: &str, options: StartOptions) -> Result<StageId, EngineError> {
        let id = self.start(kind, options).await?;
        self.run_until_idle().await?;
        Ok(id)
    }

    /// Execute queued dispatches until the queue is empty. `not_before` is
    /// ignored. Returns the number of dispatches taken from the queue.
    pub async fn run_until_idle(&self) -> Result<usize, EngineError> {
        let scheduler = self.engine.scheduler();
        let mut handled = 0;
        while handled < MAX_DISPATCHES {
            let next = if self.shuffle {
                scheduler.pop_back()
            } else {
                scheduler.pop_front()
            };
            let Some(dispatch) = next else {
                break;
            };
            if self.duplicate_delivery {
                self.deliver(&dispatch).await?;
            }
            self.deliver(&dispatch).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn deliver(&self, dispatch: &Dispatch) -> Result<(), EngineError> {
        let mut failures = 0;
        loop {
            match self.engine.handle(dispatch.clone()).await {
                Ok(_) => return Ok(()),
                Err(err) if self.redeliver && failures < MAX_REDELIVERIES => {
                    failures += 1;
                    tracing::debug!(token = %dispatch.token, error = %err, "redelivering failed dispatch");
                    *self
                        .redelivered
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.engine.scheduler().pending()
    }

    /// Resume as an in-process caller, then drive the tree to idle.
    pub async fn resume(&self, id: StageId, payload: Value) -> Result<ResumeResult, ResumeError> {
        self.resume_as(id, payload, Caller::Internal).await
    }

    pub async fn resume_as(
        &self,
        id: StageId,
        payload: Value,
        caller: Caller,
    ) -> Result<ResumeResult, ResumeError> {
        let result = self.engine.resume(id, payload, caller).await;
        self.run_until_idle().await?;
        result
    }

    pub async fn abort(&self, id: StageId, reason: &str) -> Result<AbortResult, EngineError> {
        let result = self.engine.abort(id, reason).await?;
        self.run_until_idle().await?;
        Ok(result)
    }

    pub async fn record(&self, id: StageId) -> Result<StageRecord, EngineError> {
        self.engine.get(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn outputs(&self, id: StageId) -> Result<BTreeMap<String, Value>, EngineError> {
        self.engine.outputs(id).await
    }

    pub async fn default_output(&self, id: StageId) -> Result<Option<Value>, EngineError> {
        Ok(self.record(id).await?.output(DEFAULT_OUTPUT).cloned())
    }

    /// Every event published so far, in publish order.
    pub fn events(&self) -> Vec<StageEvent> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            match receiver.try_recv() {
                Ok(event) => seen.push(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "harness event receiver lagged");
                }
                Err(_) => break,
            }
        }
        seen.clone()
    }

    /// Events of one stage, in publish order.
    pub fn events_for(&self, id: StageId) -> Vec<StageEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.stage_id() == id)
            .collect()
    }
}
