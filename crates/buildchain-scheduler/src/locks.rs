//! Per-request async locks.

use buildchain_core::RequestKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per (job, revision), created on demand.
///
/// Entries nobody holds or waits on are dropped on the next acquire, so the
/// table only ever holds keys with work in flight.
#[derive(Debug, Default)]
pub struct RequestLocks {
    table: Mutex<HashMap<RequestKey, Arc<AsyncMutex<()>>>>,
}

impl RequestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &RequestKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of keys currently held or waited on.
    pub fn in_flight(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(RequestLocks::new());
        let key = RequestKey::new("build", "rev1");

        let guard = locks.acquire(&key).await;
        assert_eq!(locks.in_flight(), 1);

        let contender = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = RequestLocks::new();
        let _build = locks.acquire(&RequestKey::new("build", "rev1")).await;
        let _other_revision = locks.acquire(&RequestKey::new("build", "rev2")).await;
        let _other_job = locks.acquire(&RequestKey::new("test", "rev1")).await;
        assert_eq!(locks.in_flight(), 3);
    }
}
