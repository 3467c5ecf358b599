//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the **transport layer** for facts that have already been
//! durably committed (ledger rows, outbox records). It is intentionally
//! lightweight and makes minimal assumptions:
//!
//! - **Transport-agnostic**: the core never references a concrete broker;
//!   implementations may back this with in-memory channels, a message queue,
//!   or a streaming platform.
//! - **At-least-once delivery**: messages may be delivered more than once;
//!   consumers must dedupe on the envelope `id`.
//! - **Ordering**: only guaranteed within one topic/partition key, and only
//!   if the implementation provides it. Never rely on global order.
//! - **No persistence**: durability lives in the outbox, not the bus. If a
//!   publish fails the record stays `unpublished` and is retried.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::envelope::EventEnvelope;
use crate::topic::Topic;

/// A subscription to one topic's message stream.
///
/// Each subscription gets a copy of every message published to its topic
/// after the subscription was created. Designed for single-threaded
/// consumption; spawn one worker per subscription.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Injected event-bus capability: `publish(topic, message)` and
/// `subscribe(topic)`.
///
/// `publish` can fail (bus full, transport error). Failures surface to the
/// caller, typically the outbox relay, which retries with backoff because
/// the record is already persisted. Implementations must be `Send + Sync`;
/// multiple threads publish concurrently.
pub trait EventBus: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, topic: &Topic, message: EventEnvelope) -> Result<(), Self::Error>;

    fn subscribe(&self, topic: &Topic) -> Subscription<EventEnvelope>;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, topic: &Topic, message: EventEnvelope) -> Result<(), Self::Error> {
        (**self).publish(topic, message)
    }

    fn subscribe(&self, topic: &Topic) -> Subscription<EventEnvelope> {
        (**self).subscribe(topic)
    }
}
