// Work queue: durable, at-least-once delivery of frame units to annotation workers

pub mod disk;
pub mod retry;

use crate::error::QueueError;
use std::time::Duration;

pub use disk::DiskQueue;

/// One delivered message. It stays owned by the consumer until acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    /// Set when the message was handed out before and put back.
    pub redelivered: bool,
}

pub trait WorkQueue: Send + Sync {
    /// Append a persistent message to the tail of the queue.
    fn publish(&self, payload: &[u8]) -> Result<(), QueueError>;

    /// Register a consumer that may hold at most `prefetch` unsettled deliveries.
    fn open_consumer(&self, prefetch: usize) -> Result<Box<dyn QueueConsumer>, QueueError>;

    /// Drop every message that has not been delivered yet. Returns the number removed.
    fn purge(&self) -> Result<usize, QueueError>;

    /// Passive message count: ready plus delivered-but-unsettled.
    fn depth(&self) -> Result<usize, QueueError>;
}

pub trait QueueConsumer: Send {
    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing arrived.
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    fn ack(&mut self, tag: u64) -> Result<(), QueueError>;

    /// Reject a delivery. With `requeue` it goes back to the head of the queue,
    /// otherwise it is dropped for good.
    fn nack(&mut self, tag: u64, requeue: bool) -> Result<(), QueueError>;
}
