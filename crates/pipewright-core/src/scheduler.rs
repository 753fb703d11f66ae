//! Scheduler port, plus an inline implementation for the test harness.
//!
//! The engine never executes work itself; it hands [`Dispatch`]es to a
//! scheduler, which delivers them to `Engine::handle` on some worker.
//! Schedulers deduplicate by token.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashSet;
use pipewright_types::dispatch::{Ack, Dispatch, DispatchToken};

/// Errors from enqueueing work.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    Closed,

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// External task dispatcher.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait Scheduler: Send + Sync {
    /// Enqueue a dispatch; a token seen before yields [`Ack::Duplicate`].
    fn enqueue(
        &self,
        dispatch: Dispatch,
    ) -> impl std::future::Future<Output = Result<Ack, SchedulerError>> + Send;
}

// ---------------------------------------------------------------------------
// InlineScheduler
// ---------------------------------------------------------------------------

/// A queue drained by the caller instead of by workers.
///
/// Only queued tokens are deduplicated; a token can be enqueued again once
/// it has been popped. `not_before` is recorded but not honoured; the
/// harness delivers everything as soon as it drains.
#[derive(Debug, Default)]
pub struct InlineScheduler {
    queue: Mutex<VecDeque<Dispatch>>,
    seen: DashSet<DispatchToken>,
}

impl InlineScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest pending dispatch.
    pub fn pop_front(&self) -> Option<Dispatch> {
        let dispatch = self.lock().pop_front()?;
        self.seen.remove(&dispatch.token);
        Some(dispatch)
    }

    /// Newest pending dispatch.
    pub fn pop_back(&self) -> Option<Dispatch> {
        let dispatch = self.lock().pop_back()?;
        self.seen.remove(&dispatch.token);
        Some(dispatch)
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Dispatch>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for InlineScheduler {
    async fn enqueue(&self, dispatch: Dispatch) -> Result<Ack, SchedulerError> {
        if !self.seen.insert(dispatch.token) {
            return Ok(Ack::Duplicate);
        }
        self.lock().push_back(dispatch);
        Ok(Ack::Accepted)
    }
}
