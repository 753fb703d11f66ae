//! Worker pool feeding scheduler deliveries to `Engine::handle`.
//!
//! Concurrency is bounded by a semaphore sized from `EngineConfig::workers`.
//! A dispatch whose handling fails for an infrastructure reason (store or
//! scheduler error, write contention) is redelivered with the same token
//! after a short backoff, so a claim it left behind can be picked up again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use pipewright_core::engine::{Engine, EngineError};
use pipewright_core::store::StageStore;
use pipewright_types::dispatch::{Dispatch, DispatchToken};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::scheduler::{DispatchReceiver, TokioScheduler};

/// Redeliveries of one token before it is dropped.
const MAX_REDELIVERIES: u32 = 5;

const REDELIVERY_BASE_DELAY: Duration = Duration::from_millis(250);

pub struct WorkerPool<S> {
    engine: Arc<Engine<S, TokioScheduler>>,
    workers: usize,
    redeliveries: Arc<DashMap<DispatchToken, u32>>,
}

impl<S: StageStore + 'static> WorkerPool<S> {
    pub fn new(engine: Arc<Engine<S, TokioScheduler>>, workers: usize) -> Self {
        Self {
            engine,
            workers: workers.max(1),
            redeliveries: Arc::new(DashMap::new()),
        }
    }

    /// Pool sized from the engine's configuration.
    pub fn from_config(engine: Arc<Engine<S, TokioScheduler>>) -> Self {
        let workers = engine.config().workers;
        Self::new(engine, workers)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Consume dispatches until `cancel` fires or the channel closes, then
    /// wait for in-flight work. Returns the number of dispatches started.
    #[tracing::instrument(name = "worker_pool", skip_all, fields(workers = self.workers))]
    pub async fn run(&self, mut receiver: DispatchReceiver, cancel: CancellationToken) -> usize {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut started = 0usize;

        tracing::info!(workers = self.workers, "worker pool started");
        loop {
            let dispatch = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(dispatch) => dispatch,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let engine = self.engine.clone();
            let redeliveries = self.redeliveries.clone();
            tasks.spawn(async move {
                let _permit = permit;
                handle_one(&engine, &redeliveries, dispatch).await;
            });
            started += 1;

            while let Some(result) = tasks.try_join_next() {
                log_join(result);
            }
        }

        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }
        tracing::info!(started, "worker pool stopped");
        started
    }
}

async fn handle_one<S: StageStore>(
    engine: &Engine<S, TokioScheduler>,
    redeliveries: &DashMap<DispatchToken, u32>,
    dispatch: Dispatch,
) {
    let token = dispatch.token;
    match engine.handle(dispatch.clone()).await {
        Ok(outcome) => {
            redeliveries.remove(&token);
            engine.scheduler().complete(&token);
            tracing::debug!(token = %token, outcome = ?outcome, "dispatch handled");
        }
        Err(err @ (EngineError::NotFound(_) | EngineError::UnknownStageKind(_))) => {
            redeliveries.remove(&token);
            engine.scheduler().complete(&token);
            tracing::warn!(token = %token, error = %err, "dropping undeliverable dispatch");
        }
        Err(err) => {
            let attempt = {
                let mut count = redeliveries.entry(token).or_insert(0);
                *count += 1;
                *count
            };
            if attempt > MAX_REDELIVERIES {
                redeliveries.remove(&token);
                engine.scheduler().complete(&token);
                tracing::error!(token = %token, error = %err, "dispatch failed repeatedly, giving up");
                return;
            }

            let delay = REDELIVERY_BASE_DELAY * 2u32.pow(attempt - 1);
            tracing::warn!(token = %token, attempt, delay_ms = delay.as_millis() as u64, error = %err, "dispatch failed, redelivering");
            let retry = Dispatch {
                not_before: chrono::TimeDelta::from_std(delay)
                    .ok()
                    .map(|delta| Utc::now() + delta),
                ..dispatch
            };
            if let Err(err) = engine.scheduler().redeliver(retry) {
                redeliveries.remove(&token);
                engine.scheduler().complete(&token);
                tracing::error!(token = %token, error = %err, "redelivery failed");
            }
        }
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            tracing::error!(error = %err, "worker task panicked");
        }
    }
}
