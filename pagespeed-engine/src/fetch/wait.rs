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
use log::trace;
use pingora_error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::{FetchResponse, UrlAsyncFetcher};

/// A fetcher that can hold back fetches until they are released explicitly, so that tests
/// can control when inputs arrive.
#[derive(Debug)]
pub struct WaitUrlFetcher {
    inner: Arc<dyn UrlAsyncFetcher>,
    holding: AtomicBool,
    waiting: AtomicUsize,
    releases: watch::Sender<u64>,
}

impl WaitUrlFetcher {
    /// Wraps a fetcher, fetches pass through until [`WaitUrlFetcher::hold`] is called
    pub fn new(inner: Arc<dyn UrlAsyncFetcher>) -> Self {
        Self {
            inner,
            holding: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
            releases: watch::Sender::new(0),
        }
    }

    /// Holds all further fetches until released
    pub fn hold(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    /// Number of fetches being held
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Lets all held fetches proceed, further fetches will be held again
    pub fn release(&self) {
        trace!("releasing {} held fetches", self.waiting());
        self.releases.send_modify(|generation| *generation += 1);
    }

    /// Releases all held fetches and stops holding new ones
    pub fn pass_through(&self) {
        self.holding.store(false, Ordering::SeqCst);
        self.release();
    }
}

#[async_trait]
impl UrlAsyncFetcher for WaitUrlFetcher {
    async fn fetch(
        &self,
        url: &str,
        request_headers: &HeaderMap,
    ) -> Result<FetchResponse, Box<Error>> {
        let mut receiver = self.releases.subscribe();
        if self.holding.load(Ordering::SeqCst) {
            trace!("holding fetch of {url}");
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _ = receiver.changed().await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.fetch(url, request_headers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MockUrlFetcher;
    use test_log::test;

    #[test(tokio::test)]
    async fn holds_until_released() {
        let mock = Arc::new(MockUrlFetcher::new());
        mock.set_text("http://test.com/a.css", "text/css", "a", 100);
        let fetcher = Arc::new(WaitUrlFetcher::new(mock));
        fetcher.hold();

        let task = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move {
                fetcher
                    .fetch("http://test.com/a.css", &HeaderMap::new())
                    .await
            })
        };
        while fetcher.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());

        fetcher.release();
        assert_eq!(task.await.unwrap().unwrap().body, "a");
        assert_eq!(fetcher.waiting(), 0);

        fetcher.pass_through();
        assert_eq!(
            fetcher
                .fetch("http://test.com/a.css", &HeaderMap::new())
                .await
                .unwrap()
                .body,
            "a"
        );
    }
}
