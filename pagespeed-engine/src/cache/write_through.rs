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
use std::sync::Arc;
use std::time::Duration;

use super::CacheInterface;

/// Two-level cache: writes go to both levels, lookups try the small fast level first and
/// populate it on hits in the large slow level.
#[derive(Debug, Clone)]
pub struct WriteThroughCache {
    small: Arc<dyn CacheInterface>,
    large: Arc<dyn CacheInterface>,
}

impl WriteThroughCache {
    /// Combines two caches
    pub fn new(small: Arc<dyn CacheInterface>, large: Arc<dyn CacheInterface>) -> Self {
        Self { small, large }
    }
}

#[async_trait]
impl CacheInterface for WriteThroughCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.small.get(key).await {
            return Some(value);
        }
        let value = self.large.get(key).await?;
        self.small.put(key, value.clone(), None).await;
        Some(value)
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        self.small.put(key, value.clone(), ttl).await;
        self.large.put(key, value, ttl).await;
    }

    async fn delete(&self, key: &str) {
        self.small.delete(key).await;
        self.large.delete(key).await;
    }

    fn name(&self) -> &'static str {
        "WriteThroughCache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCache;
    use crate::timer::MockTimer;
    use test_log::test;

    #[test(tokio::test)]
    async fn populates_small_level() {
        let timer = Arc::new(MockTimer::default());
        let small = Arc::new(LruCache::new(1000, timer.clone()));
        let large = Arc::new(LruCache::new(1000, timer));
        let cache = WriteThroughCache::new(small.clone(), large.clone());

        large.put("a", Bytes::from_static(b"1"), None).await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"1")));
        assert_eq!(small.keys(), vec!["a".to_owned()]);

        cache.put("b", Bytes::from_static(b"2"), None).await;
        assert_eq!(small.len(), 2);
        assert_eq!(large.len(), 2);

        cache.delete("a").await;
        assert!(cache.get("a").await.is_none());
        assert_eq!(large.keys(), vec!["b".to_owned()]);
    }
}
