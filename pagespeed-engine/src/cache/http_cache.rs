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

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::CacheInterface;
use crate::timer::Timer;

/// A cached HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpValue {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
    /// Date of the response in milliseconds since the epoch
    pub date_ms: i64,
    /// Time at which the response stops being fresh
    pub expiration_ms: i64,
}

/// Result of an HTTP cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpCacheLookup {
    /// A fresh response
    Found(HttpValue),
    /// A response that is no longer fresh
    Expired(HttpValue),
    /// Nothing known about this URL
    NotFound,
    /// Fetching this URL failed recently
    RecentFetchFailure,
    /// This URL recently produced an uncacheable response
    RecentlyUncacheable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EntryKind {
    Response,
    FetchFailed,
    Uncacheable,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredHead {
    kind: EntryKind,
    status: u16,
    headers: Vec<(String, String)>,
    date_ms: i64,
    expiration_ms: i64,
}

/// Cache of HTTP responses keyed by URL, on top of any key/value backend
#[derive(Debug, Clone)]
pub struct HttpCache {
    backend: Arc<dyn CacheInterface>,
    timer: Arc<dyn Timer>,
    failure_ttl_ms: i64,
}

impl HttpCache {
    /// Creates an HTTP cache. Fetch failures and uncacheable responses are remembered for
    /// `failure_ttl_ms`.
    pub fn new(
        backend: Arc<dyn CacheInterface>,
        timer: Arc<dyn Timer>,
        failure_ttl_ms: i64,
    ) -> Self {
        Self {
            backend,
            timer,
            failure_ttl_ms,
        }
    }

    /// The storage backend
    pub fn backend(&self) -> &Arc<dyn CacheInterface> {
        &self.backend
    }

    fn key(url: &str) -> String {
        format!("http/{url}")
    }

    fn encode(head: &StoredHead, body: &[u8]) -> Option<Bytes> {
        let head = match serde_json::to_vec(head) {
            Ok(head) => head,
            Err(err) => {
                warn!("failed serializing HTTP cache entry: {err}");
                return None;
            }
        };
        let mut data = BytesMut::with_capacity(4 + head.len() + body.len());
        data.put_u32(u32::try_from(head.len()).ok()?);
        data.put_slice(&head);
        data.put_slice(body);
        Some(data.freeze())
    }

    fn decode(data: Bytes) -> Option<(StoredHead, Bytes)> {
        let length = data
            .get(..4)
            .and_then(|length| length.try_into().ok())
            .map(u32::from_be_bytes)?;
        let end = 4usize.checked_add(usize::try_from(length).ok()?)?;
        let head = serde_json::from_slice(data.get(4..end)?).ok()?;
        Some((head, data.slice(end..)))
    }

    /// Looks up a URL
    pub async fn find(&self, url: &str) -> HttpCacheLookup {
        let Some(data) = self.backend.get(&Self::key(url)).await else {
            return HttpCacheLookup::NotFound;
        };
        let Some((head, body)) = Self::decode(data) else {
            warn!("corrupt HTTP cache entry for {url}, deleting");
            self.backend.delete(&Self::key(url)).await;
            return HttpCacheLookup::NotFound;
        };

        match head.kind {
            EntryKind::FetchFailed => HttpCacheLookup::RecentFetchFailure,
            EntryKind::Uncacheable => HttpCacheLookup::RecentlyUncacheable,
            EntryKind::Response => {
                let mut headers = HeaderMap::new();
                for (name, value) in head.headers {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(&value),
                    ) {
                        headers.append(name, value);
                    }
                }
                let value = HttpValue {
                    status: StatusCode::from_u16(head.status).unwrap_or(StatusCode::OK),
                    headers,
                    body,
                    date_ms: head.date_ms,
                    expiration_ms: head.expiration_ms,
                };
                if value.expiration_ms > self.timer.now_ms() {
                    HttpCacheLookup::Found(value)
                } else {
                    HttpCacheLookup::Expired(value)
                }
            }
        }
    }

    /// Stores a response
    pub async fn put(&self, url: &str, value: &HttpValue) {
        trace!("storing {url} in HTTP cache");
        let head = StoredHead {
            kind: EntryKind::Response,
            status: value.status.as_u16(),
            headers: value
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
                })
                .collect(),
            date_ms: value.date_ms,
            expiration_ms: value.expiration_ms,
        };
        if let Some(data) = Self::encode(&head, &value.body) {
            self.backend.put(&Self::key(url), data, None).await;
        }
    }

    async fn remember(&self, url: &str, kind: EntryKind) {
        let now = self.timer.now_ms();
        let head = StoredHead {
            kind,
            status: 0,
            headers: Vec::new(),
            date_ms: now,
            expiration_ms: now.saturating_add(self.failure_ttl_ms),
        };
        if let Some(data) = Self::encode(&head, &[]) {
            let ttl = Duration::from_millis(u64::try_from(self.failure_ttl_ms).unwrap_or(0));
            self.backend.put(&Self::key(url), data, Some(ttl)).await;
        }
    }

    /// Remembers that fetching a URL failed
    pub async fn remember_fetch_failed(&self, url: &str) {
        self.remember(url, EntryKind::FetchFailed).await;
    }

    /// Remembers that a URL produced an uncacheable response
    pub async fn remember_uncacheable(&self, url: &str) {
        self.remember(url, EntryKind::Uncacheable).await;
    }

    /// Removes a URL
    pub async fn delete(&self, url: &str) {
        self.backend.delete(&Self::key(url)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCache;
    use crate::timer::MockTimer;
    use http::header;
    use test_log::test;

    fn cache() -> (HttpCache, Arc<MockTimer>) {
        let timer = Arc::new(MockTimer::default());
        let backend = Arc::new(LruCache::new(10_000, timer.clone()));
        (HttpCache::new(backend, timer.clone(), 300_000), timer)
    }

    #[test(tokio::test)]
    async fn stores_responses() {
        let (cache, timer) = cache();
        let now = timer.now_ms();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/css"));
        headers.append(header::VARY, HeaderValue::from_static("Accept"));
        headers.append(header::VARY, HeaderValue::from_static("User-Agent"));
        let value = HttpValue {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"a{}"),
            date_ms: now,
            expiration_ms: now + 1000,
        };

        assert_eq!(
            cache.find("http://test.com/a.css").await,
            HttpCacheLookup::NotFound
        );
        cache.put("http://test.com/a.css", &value).await;
        assert_eq!(
            cache.find("http://test.com/a.css").await,
            HttpCacheLookup::Found(value.clone())
        );

        timer.advance_ms(1000);
        assert_eq!(
            cache.find("http://test.com/a.css").await,
            HttpCacheLookup::Expired(value)
        );

        cache.delete("http://test.com/a.css").await;
        assert_eq!(
            cache.find("http://test.com/a.css").await,
            HttpCacheLookup::NotFound
        );
    }

    #[test(tokio::test)]
    async fn remembers_failures() {
        let (cache, timer) = cache();
        cache.remember_fetch_failed("http://test.com/missing.css").await;
        cache.remember_uncacheable("http://test.com/private.css").await;
        assert_eq!(
            cache.find("http://test.com/missing.css").await,
            HttpCacheLookup::RecentFetchFailure
        );
        assert_eq!(
            cache.find("http://test.com/private.css").await,
            HttpCacheLookup::RecentlyUncacheable
        );

        timer.advance_ms(300_000);
        assert_eq!(
            cache.find("http://test.com/missing.css").await,
            HttpCacheLookup::NotFound
        );
    }

    #[test(tokio::test)]
    async fn corrupt_entries_are_dropped() {
        let (cache, _) = cache();
        cache
            .backend()
            .put("http/http://test.com/a.css", Bytes::from_static(b"\0\0\0\x10{"), None)
            .await;
        assert_eq!(
            cache.find("http://test.com/a.css").await,
            HttpCacheLookup::NotFound
        );
        assert!(cache.backend().get("http/http://test.com/a.css").await.is_none());
    }
}
