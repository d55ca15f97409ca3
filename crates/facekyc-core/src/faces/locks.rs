use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Async mutexes keyed by user id.
///
/// Holders of the same key run one at a time; different keys never wait on
/// each other. Entries nobody holds are pruned on the next acquisition.
#[derive(Debug, Default)]
pub struct UserLocks {
    slots: DashMap<String, Arc<AsyncMutex<()>>>,
}

pub type UserLockGuard = OwnedMutexGuard<()>;

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: &str) -> UserLockGuard {
        // Must run before `entry`; retain takes every shard lock.
        self.slots
            .retain(|key, slot| key == user_id || Arc::strong_count(slot) > 1);
        let slot = Arc::clone(
            self.slots
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        );
        slot.lock_owned().await
    }

    pub fn tracked(&self) -> usize {
        self.slots.len()
    }
}
