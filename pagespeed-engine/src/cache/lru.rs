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

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{ttl_ms, CacheInterface, CacheStats};
use crate::timer::Timer;

#[derive(Debug)]
struct Entry {
    value: Bytes,
    expires_at_ms: Option<i64>,
    tick: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    recency: BTreeMap<u64, String>,
    tick: u64,
    size: usize,
}

impl State {
    fn remove(&mut self, key: &str) -> bool {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
            self.size -= key.len() + entry.value.len();
            true
        } else {
            false
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// In-memory cache evicting least recently used entries once its size limit is exceeded
#[derive(Debug)]
pub struct LruCache {
    max_size: usize,
    timer: Arc<dyn Timer>,
    state: Mutex<State>,
    stats: CacheStats,
}

impl LruCache {
    /// Creates a cache holding at most `max_size` bytes of keys and values
    pub fn new(max_size: usize, timer: Arc<dyn Timer>) -> Self {
        Self {
            max_size,
            timer,
            state: Default::default(),
            stats: Default::default(),
        }
    }

    /// Operation counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of keys and values
    pub fn size(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .size
    }

    /// Drops all entries
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = State::default();
    }

    /// Lists all keys, useful for tests
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys = state.entries.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheInterface for LruCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let now = self.timer.now_ms();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let expired = match state.entries.get(key) {
            Some(entry) => entry.expires_at_ms.is_some_and(|expires| expires <= now),
            None => {
                self.stats.record_miss();
                return None;
            }
        };
        if expired {
            state.remove(key);
            self.stats.record_eviction();
            self.stats.record_miss();
            return None;
        }

        let tick = state.next_tick();
        let old_tick = state.entries.get(key).map(|entry| entry.tick);
        if let Some(old_tick) = old_tick {
            state.recency.remove(&old_tick);
        }
        state.recency.insert(tick, key.to_owned());
        let entry = state.entries.get_mut(key)?;
        entry.tick = tick;
        self.stats.record_hit();
        Some(entry.value.clone())
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let size = key.len() + value.len();
        if size > self.max_size {
            trace!("not caching {key}, {size} bytes exceed cache size");
            return;
        }

        let expires_at_ms = ttl_ms(ttl).map(|ttl| self.timer.now_ms().saturating_add(ttl));
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.remove(key);

        while state.size + size > self.max_size {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&oldest) {
                state.size -= oldest.len() + entry.value.len();
            }
            self.stats.record_eviction();
        }

        let tick = state.next_tick();
        state.recency.insert(tick, key.to_owned());
        state.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at_ms,
                tick,
            },
        );
        state.size += size;
        self.stats.record_insert();
    }

    async fn delete(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.remove(key) {
            self.stats.record_delete();
        }
    }

    fn name(&self) -> &'static str {
        "LruCache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::MockTimer;
    use test_log::test;

    fn cache(max_size: usize) -> (LruCache, Arc<MockTimer>) {
        let timer = Arc::new(MockTimer::default());
        (LruCache::new(max_size, timer.clone()), timer)
    }

    #[test(tokio::test)]
    async fn put_get_delete() {
        let (cache, _) = cache(100);
        assert_eq!(cache.get("a").await, None);
        cache.put("a", Bytes::from_static(b"value"), None).await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"value")));
        assert_eq!(cache.size(), 6);

        cache.put("a", Bytes::from_static(b"v2"), None).await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"v2")));
        assert_eq!(cache.size(), 3);

        cache.delete("a").await;
        assert_eq!(cache.get("a").await, None);
        assert!(cache.is_empty());

        assert_eq!(cache.stats().hits(), 2);
        assert_eq!(cache.stats().misses(), 2);
        assert_eq!(cache.stats().inserts(), 2);
        assert_eq!(cache.stats().deletes(), 1);
    }

    #[test(tokio::test)]
    async fn evicts_least_recently_used() {
        let (cache, _) = cache(10);
        cache.put("a", Bytes::from_static(b"1234"), None).await;
        cache.put("b", Bytes::from_static(b"1234"), None).await;
        assert!(cache.get("a").await.is_some());

        cache.put("c", Bytes::from_static(b"1234"), None).await;
        assert_eq!(cache.keys(), vec!["a".to_owned(), "c".to_owned()]);
        assert_eq!(cache.stats().evictions(), 1);

        cache.put("d", Bytes::from_static(b"0123456789"), None).await;
        assert_eq!(cache.get("d").await, None);
        assert_eq!(cache.len(), 2);
    }

    #[test(tokio::test)]
    async fn ttl_expiry() {
        let (cache, timer) = cache(100);
        cache
            .put("a", Bytes::from_static(b"1"), Some(Duration::from_secs(10)))
            .await;
        timer.advance_ms(9_999);
        assert!(cache.get("a").await.is_some());
        timer.advance_ms(1);
        assert!(cache.get("a").await.is_none());
        assert!(cache.is_empty());
    }
}
