//! In-memory delayed queue.

use super::message::{Envelope, Message};
use super::{Delivery, Queue};
use crate::config::QueueConfig;
use crate::errors::QueueError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug)]
struct Pending {
    envelope: Envelope,
    deliver_at: Instant,
    seq: u64,
}

#[derive(Debug)]
struct InFlight {
    envelope: Envelope,
    fingerprint: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, Pending>,
    in_flight: HashMap<String, InFlight>,
    dead_letters: Vec<Envelope>,
    seq: u64,
}

/// A process-local queue with delayed delivery and ack timeouts.
///
/// Uses tokio's clock, so paused-time tests control delivery.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    ack_timeout: Duration,
    max_attempts: u32,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl InMemoryQueue {
    /// Creates a queue.
    #[must_use]
    pub fn new(ack_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ack_timeout,
            max_attempts,
        }
    }

    /// Creates a queue from configuration.
    #[must_use]
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.ack_timeout(), config.max_delivery_attempts)
    }

    /// Messages waiting for delivery plus deliveries awaiting ack.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.in_flight.len()
    }

    /// Returns true if nothing is pending or in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages deliverable right now.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .pending
            .values()
            .filter(|p| p.deliver_at <= now)
            .count()
    }

    /// Deliveries awaiting ack.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// When the next pending message becomes deliverable.
    #[must_use]
    pub fn next_delivery_at(&self) -> Option<Instant> {
        self.state.lock().pending.values().map(|p| p.deliver_at).min()
    }

    /// Messages that exhausted their delivery attempts.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<Envelope> {
        self.state.lock().dead_letters.clone()
    }

    /// Pending messages, in delivery order.
    #[must_use]
    pub fn pending_messages(&self) -> Vec<Message> {
        let state = self.state.lock();
        let mut pending: Vec<&Pending> = state.pending.values().collect();
        pending.sort_by_key(|p| (p.deliver_at, p.seq));
        pending.iter().map(|p| p.envelope.message.clone()).collect()
    }

    fn enqueue(state: &mut QueueState, fingerprint: String, envelope: Envelope, deliver_at: Instant) {
        if let Some(existing) = state.pending.get_mut(&fingerprint) {
            debug!(
                message_type = envelope.message.message_type(),
                execution_id = envelope.message.execution_id(),
                "Coalesced duplicate message"
            );
            existing.deliver_at = existing.deliver_at.min(deliver_at);
            return;
        }
        state.seq += 1;
        let seq = state.seq;
        state.pending.insert(
            fingerprint,
            Pending {
                envelope,
                deliver_at,
                seq,
            },
        );
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn push(&self, message: Message, delay: Duration) -> Result<(), QueueError> {
        let fingerprint = message.fingerprint()?;
        let deliver_at = Instant::now() + delay;
        let mut state = self.state.lock();
        Self::enqueue(&mut state, fingerprint, Envelope::new(message), deliver_at);
        Ok(())
    }

    async fn poll(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut ready: Vec<(Instant, u64, String)> = state
            .pending
            .iter()
            .filter(|(_, p)| p.deliver_at <= now)
            .map(|(fp, p)| (p.deliver_at, p.seq, fp.clone()))
            .collect();
        ready.sort();
        ready.truncate(max);

        let mut deliveries = Vec::with_capacity(ready.len());
        for (_, _, fingerprint) in ready {
            let Some(pending) = state.pending.remove(&fingerprint) else {
                continue;
            };
            let mut envelope = pending.envelope;
            envelope.attempt_count += 1;

            let receipt = Uuid::new_v4().to_string();
            state.in_flight.insert(
                receipt.clone(),
                InFlight {
                    envelope: envelope.clone(),
                    fingerprint,
                    deadline: now + self.ack_timeout,
                },
            );
            deliveries.push(Delivery { receipt, envelope });
        }
        Ok(deliveries)
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.state
            .lock()
            .in_flight
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))
    }

    async fn retry_unacked(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        let mut redelivered = 0;
        for receipt in expired {
            let Some(in_flight) = state.in_flight.remove(&receipt) else {
                continue;
            };
            let message = &in_flight.envelope.message;

            if in_flight.envelope.attempt_count >= self.max_attempts {
                error!(
                    message_type = message.message_type(),
                    execution_id = message.execution_id(),
                    attempts = in_flight.envelope.attempt_count,
                    "Message exhausted delivery attempts, dead-lettering"
                );
                state.dead_letters.push(in_flight.envelope);
                continue;
            }

            warn!(
                message_type = message.message_type(),
                execution_id = message.execution_id(),
                attempts = in_flight.envelope.attempt_count,
                "Redelivering unacked message"
            );
            Self::enqueue(&mut state, in_flight.fingerprint, in_flight.envelope, now);
            redelivered += 1;
        }
        Ok(redelivered)
    }
}
