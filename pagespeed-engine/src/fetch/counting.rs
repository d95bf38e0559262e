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
use http::HeaderMap;
use pingora_error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{FetchResponse, UrlAsyncFetcher};

/// Wraps a fetcher and counts the fetches going through it
#[derive(Debug)]
pub struct CountingUrlFetcher {
    inner: Arc<dyn UrlAsyncFetcher>,
    fetches: AtomicU64,
    failures: AtomicU64,
    bytes: AtomicU64,
}

impl CountingUrlFetcher {
    /// Wraps a fetcher
    pub fn new(inner: Arc<dyn UrlAsyncFetcher>) -> Self {
        Self {
            inner,
            fetches: Default::default(),
            failures: Default::default(),
            bytes: Default::default(),
        }
    }

    /// Number of fetches started
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of fetches that didn't produce a response
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Total size of all response bodies received
    pub fn byte_count(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Resets the counters
    pub fn clear(&self) {
        self.fetches.store(0, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        self.bytes.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl UrlAsyncFetcher for CountingUrlFetcher {
    async fn fetch(
        &self,
        url: &str,
        request_headers: &HeaderMap,
    ) -> Result<FetchResponse, Box<Error>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.fetch(url, request_headers).await;
        match &result {
            Ok(response) => {
                self.bytes.fetch_add(
                    u64::try_from(response.body.len()).unwrap_or(u64::MAX),
                    Ordering::SeqCst,
                );
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
        }
        result
    }
}
