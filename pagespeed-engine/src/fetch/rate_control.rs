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
use log::debug;
use pingora_error::{Error, ErrorType};
use pingora_limits::inflight::Inflight;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use url::Url;

use super::{FetchResponse, UrlAsyncFetcher};
use crate::workers::TOO_BUSY;

/// Limits the number of concurrent fetches per host. Up to `queue_size` fetches beyond the
/// limit wait for their turn, any further ones fail immediately.
pub struct RateControllingFetcher {
    inner: Arc<dyn UrlAsyncFetcher>,
    max_per_host: usize,
    queue_size: usize,
    inflight: Inflight,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl std::fmt::Debug for RateControllingFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateControllingFetcher")
            .field("inner", &self.inner)
            .field("max_per_host", &self.max_per_host)
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl RateControllingFetcher {
    /// Wraps a fetcher
    pub fn new(inner: Arc<dyn UrlAsyncFetcher>, max_per_host: usize, queue_size: usize) -> Self {
        Self {
            inner,
            max_per_host: max_per_host.max(1),
            queue_size,
            inflight: Inflight::new(),
            hosts: Default::default(),
        }
    }

    fn semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
            .clone()
    }
}

#[async_trait]
impl UrlAsyncFetcher for RateControllingFetcher {
    async fn fetch(
        &self,
        url: &str,
        request_headers: &HeaderMap,
    ) -> Result<FetchResponse, Box<Error>> {
        let host = Url::parse(url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_default();

        let (_guard, count) = self.inflight.incr(&host, 1);
        let limit = self.max_per_host.saturating_add(self.queue_size);
        if usize::try_from(count).unwrap_or(0) > limit {
            debug!("too many fetches for {host}, dropping fetch of {url}");
            return Err(Error::explain(
                TOO_BUSY,
                format!("fetch queue for {host} is full"),
            ));
        }

        let _permit = self.semaphore(&host).acquire_owned().await.map_err(|err| {
            Error::because(ErrorType::InternalError, "fetch limiter closed", err)
        })?;
        self.inner.fetch(url, request_headers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{MockUrlFetcher, WaitUrlFetcher};
    use test_log::test;

    #[test(tokio::test)]
    async fn limits_per_host() {
        let mock = Arc::new(MockUrlFetcher::new());
        mock.set_text("http://a.com/1.css", "text/css", "1", 100);
        mock.set_text("http://b.com/1.css", "text/css", "1", 100);
        let wait = Arc::new(WaitUrlFetcher::new(mock));
        wait.hold();
        let fetcher = Arc::new(RateControllingFetcher::new(wait.clone(), 1, 1));

        let spawn = |url: &'static str| {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.fetch(url, &HeaderMap::new()).await })
        };

        // One fetch is running, one queued, the third fails
        let first = spawn("http://a.com/1.css");
        while wait.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        let second = spawn("http://a.com/1.css");
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let err = fetcher
            .fetch("http://a.com/1.css", &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.etype(), &TOO_BUSY);

        // Other hosts are unaffected
        let other = spawn("http://b.com/1.css");
        while wait.waiting() < 2 {
            tokio::task::yield_now().await;
        }

        wait.pass_through();
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert!(other.await.unwrap().is_ok());
    }
}
