//! Per-user admission locks
//!
//! Serializes check-then-consume for one user while leaving other users
//! independent. Entries are dropped from the map once nobody holds or waits
//! on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Map of user id to async mutex
#[derive(Debug, Clone, Default)]
pub struct UserLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive admission rights for `user_id`
    pub async fn acquire(&self, user_id: &str) -> UserLockGuard {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(user_id.to_string()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        UserLockGuard {
            locks: self.locks.clone(),
            user_id: user_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Number of users with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held admission rights; released on drop
#[derive(Debug)]
pub struct UserLockGuard {
    locks: Arc<Mutex<LockMap>>,
    user_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this guard still reference the mutex: no waiters
        let idle = map
            .get(&self.user_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(&self.lock) == 2);
        if idle {
            map.remove(&self.user_id);
        }
    }
}
