//! Service-wide notifications.
//!
//! Components publish what happened; whoever cares (the binary's log
//! consumer, a dashboard, tests) subscribes. Publishing never blocks and never
//! fails when nobody listens.

use shared::{ConnectionState, DeliveryResult, MessageJob, PlayerRecord};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    PlayerJoined(PlayerRecord),
    PlayerLeft(PlayerRecord),
    PollFailed(String),
    Delivery {
        job: MessageJob,
        result: DeliveryResult,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ServiceEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ServiceEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(5),
        });

        match rx.recv().await.unwrap() {
            ServiceEvent::ReconnectScheduled { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(5));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(ServiceEvent::PollFailed("timed out".into()));
    }
}
