// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Named locks with expiry, used to keep concurrent rewrites of the same partition key from
//! duplicating work.

use log::debug;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::timer::{SystemTimer, Timer};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Proof of holding a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    id: u64,
}

impl LockToken {
    /// The locked key
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Atomic named locks. A lock held for longer than its TTL can be stolen by the next
/// requester.
pub trait LockManager: Debug + Send + Sync {
    /// Takes the lock if it is free or expired
    fn try_lock(&self, key: &str, ttl: Duration) -> Option<LockToken>;

    /// Releases a lock, a no-op if the lock has been stolen in the meantime
    fn unlock(&self, token: &LockToken);

    /// Checks whether a lock is currently held
    fn is_locked(&self, key: &str) -> bool;
}

#[derive(Debug)]
struct HeldLock {
    id: u64,
    expires_at_ms: i64,
}

/// In-process lock manager
#[derive(Debug)]
pub struct MemLockManager {
    timer: Arc<dyn Timer>,
    locks: Mutex<HashMap<String, HeldLock>>,
    next_id: AtomicU64,
}

impl MemLockManager {
    /// Creates a lock manager measuring expiry with the given timer
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        Self {
            timer,
            locks: Default::default(),
            next_id: AtomicU64::new(1),
        }
    }

    /// The lock manager shared by all engines of this process
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<MemLockManager>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(Self::new(Arc::new(SystemTimer))))
            .clone()
    }
}

impl LockManager for MemLockManager {
    fn try_lock(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = self.timer.now_ms();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(held) = locks.get(key) {
            if held.expires_at_ms > now {
                return None;
            }
            debug!("stealing expired lock {key}");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        locks.insert(
            key.to_owned(),
            HeldLock {
                id,
                expires_at_ms: now.saturating_add(ttl),
            },
        );
        Some(LockToken {
            key: key.to_owned(),
            id,
        })
    }

    fn unlock(&self, token: &LockToken) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&token.key).is_some_and(|held| held.id == token.id) {
            locks.remove(&token.key);
        }
    }

    fn is_locked(&self, key: &str) -> bool {
        let now = self.timer.now_ms();
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(key).is_some_and(|held| held.expires_at_ms > now)
    }
}

/// Tries to take a lock, polling until `wait` elapses.
pub async fn lock_with_wait(
    manager: &dyn LockManager,
    key: &str,
    ttl: Duration,
    wait: Duration,
) -> Option<LockToken> {
    let deadline = Instant::now() + wait;
    loop {
        if let Some(token) = manager.try_lock(key, ttl) {
            return Some(token);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}
