//! Execution queue: message schema and transport contract.
//!
//! Delivery is at-least-once. A delivery that is not acked within the ack
//! timeout is redelivered, and a message that keeps failing is eventually
//! dead-lettered.

mod memory;
mod message;

pub use memory::InMemoryQueue;
pub use message::{Envelope, Message};

use crate::errors::QueueError;
use async_trait::async_trait;
use std::time::Duration;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Receipt to ack with.
    pub receipt: String,
    /// The delivered message.
    pub envelope: Envelope,
}

/// Trait for queue transports.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueues a message for delivery after `delay`.
    ///
    /// A message identical to one still waiting for delivery is coalesced
    /// into it, keeping the earlier delivery time.
    async fn push(&self, message: Message, delay: Duration) -> Result<(), QueueError>;

    /// Takes up to `max` ready messages.
    async fn poll(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledges a delivery so it is not redelivered.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;

    /// Redelivers deliveries whose ack timeout expired, dead-lettering those
    /// out of attempts. Returns how many were redelivered.
    async fn retry_unacked(&self) -> Result<usize, QueueError>;
}
