//! # Event Publisher
//!
//! Every subsystem reports state changes through one shared publisher.
//!
//! ```rust
//! use resilience_core::events::{EventPublisher, ResilienceEvent};
//! use resilience_core::degradation::SystemState;
//!
//! # tokio_test::block_on(async {
//! let publisher = EventPublisher::new(16);
//! let mut receiver = publisher.subscribe();
//!
//! publisher.publish(ResilienceEvent::StateTransition {
//!     from: SystemState::Normal,
//!     to: SystemState::UnderLoad,
//! });
//!
//! let published = receiver.recv().await.unwrap();
//! assert_eq!(published.event.name(), "degradation.state_transition");
//! # });
//! ```

use super::types::ResilienceEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Bounded fan-out of resilience events
///
/// Backed by a broadcast channel: publishing never blocks, and a subscriber that falls
/// more than `capacity` events behind observes `RecvError::Lagged` instead of stalling
/// the publisher.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
    capacity: usize,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: ResilienceEvent,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Publish an event; events with no subscribers are dropped
    pub fn publish(&self, event: ResilienceEvent) {
        trace!(event = event.name(), "Publishing event");
        let published = PublishedEvent {
            event,
            published_at: chrono::Utc::now(),
        };

        // send() only fails when there are no receivers
        let _ = self.sender.send(published);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000) // Default capacity of 1000 events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::new(4);
        publisher.publish(ResilienceEvent::TaskCancelled {
            task_id: uuid::Uuid::new_v4(),
        });
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let publisher = EventPublisher::new(4);
        let mut rx = publisher.subscribe();
        publisher.publish(ResilienceEvent::CacheMiss {
            namespace: "holidays".to_string(),
            key: "2025".to_string(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event.name(), "cache.miss");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let publisher = EventPublisher::new(2);
        let mut rx = publisher.subscribe();
        for _ in 0..5 {
            publisher.publish(ResilienceEvent::TaskCancelled {
                task_id: uuid::Uuid::new_v4(),
            });
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
    }
}
