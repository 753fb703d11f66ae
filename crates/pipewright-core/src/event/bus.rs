//! Stage lifecycle events fanned out over `tokio::sync::broadcast`.
//!
//! The engine publishes every transition here. Events are lost when nobody
//! is subscribed, and a slow subscriber sees `Lagged` once the channel
//! capacity is exceeded.

use pipewright_types::event::StageEvent;
use tokio::sync::broadcast;

pub struct EventBus {
    sender: broadcast::Sender<StageEvent>,
}

impl EventBus {
    /// `capacity` of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: StageEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("stage event published with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;

    fn completed() -> StageEvent {
        let id = identity::new_root();
        StageEvent::Completed {
            stage_id: id,
            root_id: id,
        }
    }

    #[tokio::test]
    async fn subscribers_each_see_published_events() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let event = completed();
        bus.publish(event.clone());

        assert_eq!(first.recv().await.unwrap().stage_id(), event.stage_id());
        assert_eq!(second.recv().await.unwrap().stage_id(), event.stage_id());
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(16);
        bus.publish(completed());
        let mut late = bus.subscribe();
        assert!(matches!(late.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[test]
    fn zero_capacity_still_delivers() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(completed());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn slow_subscriber_lags() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        for _ in 0..10 {
            bus.publish(completed());
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(6))
        ));
    }
}
