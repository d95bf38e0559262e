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

//! Cache backends: the key/value interface shared by the metadata cache and the HTTP cache,
//! an in-memory LRU, a filesystem cache and a two-level combination of both.

mod file;
mod http_cache;
mod lru;
mod write_through;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use file::{CleanPolicy, FileCache};
pub use http_cache::{HttpCache, HttpCacheLookup, HttpValue};
pub use lru::LruCache;
pub use write_through::WriteThroughCache;

/// Asynchronous key/value store
#[async_trait]
pub trait CacheInterface: Debug + Send + Sync {
    /// Looks up a key
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Stores a value, replacing any previous one. Values with a TTL disappear once it passes.
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>);

    /// Removes a key
    async fn delete(&self, key: &str);

    /// Name of the backend for log messages
    fn name(&self) -> &'static str;
}

/// Operation counters of a cache backend
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Number of successful lookups
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of failed lookups
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of stored values
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Number of explicit deletions
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Number of values dropped to make room or because they expired
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Resets all counters
    pub fn clear(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.inserts,
            &self.deletes,
            &self.evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn ttl_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}
