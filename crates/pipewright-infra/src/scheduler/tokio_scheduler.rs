//! In-process scheduler on top of a tokio channel.
//!
//! Deduplicates by dispatch token and honours `not_before` by parking the
//! dispatch on a timer task. Delivered dispatches are read from the
//! [`DispatchReceiver`] by the worker pool, which reports each token back
//! through [`TokioScheduler::complete`] once it is handled.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pipewright_core::scheduler::{Scheduler, SchedulerError};
use pipewright_types::dispatch::{Ack, Dispatch, DispatchToken};
use tokio::sync::mpsc;

/// Receiving half handed to the worker pool.
pub type DispatchReceiver = mpsc::UnboundedReceiver<Dispatch>;

/// Token-deduplicating scheduler backed by an unbounded mpsc channel.
#[derive(Clone)]
pub struct TokioScheduler {
    sender: mpsc::UnboundedSender<Dispatch>,
    /// Tokens queued or being handled, with the queue they were accepted on.
    seen: Arc<DashMap<DispatchToken, String>>,
}

impl TokioScheduler {
    pub fn new() -> (Self, DispatchReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                seen: Arc::new(DashMap::new()),
            },
            receiver,
        )
    }

    /// Deliver a dispatch again, bypassing deduplication.
    ///
    /// Used by workers when `Engine::handle` failed for an infrastructure
    /// reason and the same token must be retried.
    pub fn redeliver(&self, dispatch: Dispatch) -> Result<(), SchedulerError> {
        self.deliver(dispatch)
    }

    /// Forget a handled token. Enqueueing it again delivers it again.
    pub fn complete(&self, token: &DispatchToken) {
        self.seen.remove(token);
    }

    /// Tokens queued or being handled.
    pub fn in_flight(&self) -> usize {
        self.seen.len()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn deliver(&self, dispatch: Dispatch) -> Result<(), SchedulerError> {
        let delay = dispatch
            .not_before
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|d| !d.is_zero());

        match delay {
            None => self
                .sender
                .send(dispatch)
                .map_err(|_| SchedulerError::Closed),
            Some(delay) => {
                if self.sender.is_closed() {
                    return Err(SchedulerError::Closed);
                }
                let sender = self.sender.clone();
                tracing::debug!(token = %dispatch.token, delay_ms = delay.as_millis() as u64, "dispatch delayed");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if sender.send(dispatch).is_err() {
                        tracing::debug!("scheduler closed before delayed dispatch was delivered");
                    }
                });
                Ok(())
            }
        }
    }
}

impl Scheduler for TokioScheduler {
    async fn enqueue(&self, dispatch: Dispatch) -> Result<Ack, SchedulerError> {
        let token = dispatch.token;
        match self.seen.entry(token) {
            Entry::Occupied(_) => return Ok(Ack::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(dispatch.queue.clone());
            }
        }

        if let Err(err) = self.deliver(dispatch) {
            self.seen.remove(&token);
            return Err(err);
        }
        Ok(Ack::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pipewright_types::stage::StageId;

    use super::*;

    fn dispatch(token: DispatchToken) -> Dispatch {
        Dispatch {
            token,
            not_before: None,
            queue: "default".to_string(),
        }
    }

    fn stage_id() -> StageId {
        StageId(uuid::Uuid::now_v7())
    }

    #[tokio::test]
    async fn test_enqueue_delivers_immediately() {
        let (scheduler, mut receiver) = TokioScheduler::new();
        let token = DispatchToken::run(stage_id(), 1);

        let ack = scheduler.enqueue(dispatch(token)).await.unwrap();
        assert_eq!(ack, Ack::Accepted);

        let delivered = receiver.try_recv().unwrap();
        assert_eq!(delivered.token, token);
    }

    #[tokio::test]
    async fn test_duplicate_token_is_not_delivered_twice() {
        let (scheduler, mut receiver) = TokioScheduler::new();
        let token = DispatchToken::finalize(stage_id());

        assert_eq!(scheduler.enqueue(dispatch(token)).await.unwrap(), Ack::Accepted);
        assert_eq!(scheduler.enqueue(dispatch(token)).await.unwrap(), Ack::Duplicate);

        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
        assert_eq!(scheduler.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_not_before_delays_delivery() {
        let (scheduler, mut receiver) = TokioScheduler::new();
        let token = DispatchToken::run(stage_id(), 2);
        let delayed = Dispatch {
            not_before: Some(Utc::now() + chrono::TimeDelta::milliseconds(200)),
            ..dispatch(token)
        };

        scheduler.enqueue(delayed).await.unwrap();
        assert!(receiver.try_recv().is_err());

        let delivered = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.token, token);
    }

    #[tokio::test]
    async fn test_past_not_before_is_immediate() {
        let (scheduler, mut receiver) = TokioScheduler::new();
        let late = Dispatch {
            not_before: Some(Utc::now() - chrono::TimeDelta::seconds(30)),
            ..dispatch(DispatchToken::run(stage_id(), 1))
        };

        scheduler.enqueue(late).await.unwrap();
        assert!(receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_redeliver_bypasses_dedup() {
        let (scheduler, mut receiver) = TokioScheduler::new();
        let token = DispatchToken::evaluate(stage_id(), 1);

        scheduler.enqueue(dispatch(token)).await.unwrap();
        scheduler.redeliver(dispatch(token)).unwrap();

        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_closed_receiver_rejects_and_forgets_token() {
        let (scheduler, receiver) = TokioScheduler::new();
        drop(receiver);
        let token = DispatchToken::run(stage_id(), 1);

        let err = scheduler.enqueue(dispatch(token)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Closed));
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_complete_forgets_token() {
        let (scheduler, mut receiver) = TokioScheduler::new();
        let token = DispatchToken::run(stage_id(), 1);

        scheduler.enqueue(dispatch(token)).await.unwrap();
        receiver.try_recv().unwrap();
        scheduler.complete(&token);
        assert_eq!(scheduler.in_flight(), 0);

        assert_eq!(scheduler.enqueue(dispatch(token)).await.unwrap(), Ack::Accepted);
        assert!(receiver.try_recv().is_ok());
    }
}
