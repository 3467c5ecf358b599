//! In-memory event bus for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};
use crate::envelope::EventEnvelope;
use crate::topic::Topic;

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

/// In-memory per-topic pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out per topic
/// - At-least-once acceptable (subscribers must be idempotent)
#[derive(Debug)]
pub struct InMemoryEventBus {
    subscribers: Mutex<HashMap<Topic, Vec<mpsc::Sender<EventEnvelope>>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

impl EventBus for InMemoryEventBus {
    type Error = InMemoryBusError;

    fn publish(&self, topic: &Topic, message: EventEnvelope) -> Result<(), Self::Error> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;

        if let Some(senders) = subs.get_mut(topic) {
            // Drop any dead subscribers while publishing.
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }

        Ok(())
    }

    fn subscribe(&self, topic: &Topic) -> Subscription<EventEnvelope> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.entry(topic.clone()).or_default().push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope::new(
            Uuid::now_v7(),
            event_type,
            1,
            Utc::now(),
            None,
            None,
            serde_json::json!({}),
        )
    }

    #[test]
    fn subscriber_receives_only_its_topic() {
        let bus = InMemoryEventBus::new();
        let deposits = Topic::new("transaction.deposit.completed");
        let loans = Topic::new("loan.approved");

        let sub = bus.subscribe(&deposits);

        bus.publish(&loans, envelope("loan.approved")).unwrap();
        bus.publish(&deposits, envelope("transaction.deposit.completed"))
            .unwrap();

        let received = sub.try_recv().unwrap();
        assert_eq!(received.event_type(), "transaction.deposit.completed");
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn dead_subscribers_are_dropped() {
        let bus = InMemoryEventBus::new();
        let topic = Topic::new("member.onboarded");

        drop(bus.subscribe(&topic));
        let live = bus.subscribe(&topic);

        bus.publish(&topic, envelope("member.onboarded")).unwrap();
        assert!(live.try_recv().is_ok());
    }
}
