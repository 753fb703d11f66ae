//! Application state wiring the engine to its SQLite store and worker pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipewright_core::engine::Engine;
use pipewright_infra::callback::CallbackGate;
use pipewright_infra::config::{database_url, load_engine_config, resolve_data_dir};
use pipewright_infra::scheduler::{DispatchReceiver, TokioScheduler};
use pipewright_infra::sqlite::pool::DatabasePool;
use pipewright_infra::sqlite::stage_store::SqliteStageStore;
use pipewright_infra::worker::WorkerPool;
use pipewright_types::event::StageEvent;
use pipewright_types::stage::StageId;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::demos;

pub type ConcreteEngine = Engine<SqliteStageStore, TokioScheduler>;

pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub gate: CallbackGate,
    receiver: Mutex<Option<DispatchReceiver>>,
}

/// How a wait for a workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// The root reached `Finalized` or `Aborted`.
    Terminal,
    /// Nothing happened for a while; stages are suspended or backing off.
    Idle,
    /// The overall deadline passed.
    TimedOut,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::new(&database_url(&config, &data_dir)).await?;
        let (scheduler, receiver) = TokioScheduler::new();
        let gate = CallbackGate::from_config(&config);
        let engine = Engine::new(
            SqliteStageStore::new(pool),
            scheduler,
            demos::registry(),
            config,
        );

        Ok(Self {
            engine: Arc::new(engine),
            gate,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Run the worker pool until the tree of `root_id` settles.
    ///
    /// `events` must be subscribed before the work that is waited on was
    /// started, or early events are missed.
    pub async fn drive(
        &self,
        root_id: StageId,
        mut events: broadcast::Receiver<StageEvent>,
        deadline: Duration,
        idle: Duration,
    ) -> anyhow::Result<Settled> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| anyhow::anyhow!("dispatch receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker pool already running"))?;

        let cancel = CancellationToken::new();
        let workers = WorkerPool::from_config(self.engine.clone());
        let token = cancel.clone();
        let pool = tokio::spawn(async move { workers.run(receiver, token).await });

        let settled = tokio::time::timeout(deadline, async {
            loop {
                match tokio::time::timeout(idle, events.recv()).await {
                    Err(_) => return Settled::Idle,
                    Ok(Ok(
                        StageEvent::Finalized { stage_id, .. } | StageEvent::Aborted { stage_id, .. },
                    )) if stage_id == root_id => return Settled::Terminal,
                    Ok(Ok(_)) => {}
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        tracing::debug!(skipped, "event receiver lagged");
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => return Settled::Idle,
                }
            }
        })
        .await
        .unwrap_or(Settled::TimedOut);

        cancel.cancel();
        let started = pool.await?;
        tracing::debug!(started, settled = ?settled, "worker pool drained");
        Ok(settled)
    }
}
