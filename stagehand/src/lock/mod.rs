//! Cluster lock contract and an in-memory implementation.
//!
//! Leases are time-bounded: a holder that dies without releasing only blocks
//! others until the TTL expires.

mod memory;

pub use memory::InMemoryLockManager;

use crate::errors::LockError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The lock key.
    pub key: String,
    /// Opaque owner token; release must present it.
    pub token: String,
    /// When the lease lapses.
    pub expires_at: Instant,
}

/// Trait for cluster-wide mutual exclusion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Tries to take the lock; `Ok(None)` if someone else holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Releases a lease. Releasing an expired lease is not an error.
    async fn release(&self, lease: &Lease) -> Result<(), LockError>;
}

/// Lock key guarding a single task attempt.
#[must_use]
pub fn task_lock_key(execution_id: &str, stage_id: &str, task_id: &str) -> String {
    format!("task:{execution_id}:{stage_id}:{task_id}")
}

/// Lock key guarding a scheduled agent.
#[must_use]
pub fn agent_lock_key(agent: &str) -> String {
    format!("cleanup-agent:{agent}")
}
