//! In-memory lock manager.

use super::{Lease, LockManager};
use crate::errors::LockError;
use crate::utils::new_lease_token;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Lease store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: DashMap<String, Lease>,
}

impl InMemoryLockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if an unexpired lease exists for `key`.
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .is_some_and(|l| l.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let now = Instant::now();
        let lease = Lease {
            key: key.to_string(),
            token: new_lease_token(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().expires_at > now {
                    debug!(key = %key, "Lock held by another owner");
                    return Ok(None);
                }
                existing.insert(lease.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(lease.clone());
            }
        }
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        match self.leases.entry(lease.key.clone()) {
            Entry::Occupied(existing) if existing.get().token == lease.token => {
                existing.remove();
                Ok(())
            }
            Entry::Occupied(existing) if existing.get().expires_at > Instant::now() => {
                Err(LockError::NotOwner {
                    key: lease.key.clone(),
                    owner: lease.token.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_is_denied() {
        let locks = InMemoryLockManager::new();
        let first = locks.try_acquire("k", Duration::from_secs(30)).await.unwrap();
        let second = locks.try_acquire("k", Duration::from_secs(30)).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(locks.is_held("k"));
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let locks = InMemoryLockManager::new();
        let lease = locks.try_acquire("k", Duration::from_secs(30)).await.unwrap().unwrap();
        locks.release(&lease).await.unwrap();

        assert!(!locks.is_held("k"));
        assert!(locks.try_acquire("k", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken() {
        let locks = InMemoryLockManager::new();
        let stale = locks.try_acquire("k", Duration::from_secs(5)).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = locks.try_acquire("k", Duration::from_secs(5)).await.unwrap().unwrap();
        assert_ne!(stale.token, fresh.token);

        // the stale holder releasing must not drop the new lease
        let err = locks.release(&stale).await.unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
        assert!(locks.is_held("k"));
    }

    #[test]
    fn test_releasing_unknown_lease_is_noop() {
        let locks = InMemoryLockManager::new();
        let lease = Lease {
            key: "gone".to_string(),
            token: new_lease_token(),
            expires_at: Instant::now(),
        };
        tokio_test::assert_ok!(tokio_test::block_on(locks.release(&lease)));
        assert!(!locks.is_held("gone"));
    }
}
