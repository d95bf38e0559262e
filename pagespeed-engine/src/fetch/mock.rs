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
use http::{header, HeaderMap, HeaderValue, StatusCode};
use log::trace;
use pingora_error::{Error, ErrorType};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{FetchResponse, UrlAsyncFetcher};

#[derive(Debug, Clone)]
enum MockEntry {
    Response(FetchResponse),
    Failure,
}

/// A fetcher serving canned responses. URLs without a configured response produce 404 Not
/// Found.
#[derive(Debug, Default)]
pub struct MockUrlFetcher {
    entries: Mutex<HashMap<String, MockEntry>>,
}

impl MockUrlFetcher {
    /// Creates a fetcher without any responses
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the response for a URL
    pub fn set_response(&self, url: &str, response: FetchResponse) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_owned(), MockEntry::Response(response));
    }

    /// Configures a successful response with the given content type, cacheable for `ttl_secs`
    /// seconds.
    pub fn set_text(&self, url: &str, content_type: &str, body: impl Into<Bytes>, ttl_secs: u64) {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("max-age={ttl_secs}")) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        self.set_response(url, FetchResponse::new(StatusCode::OK, headers, body));
    }

    /// Makes fetches of a URL fail without a response
    pub fn set_failure(&self, url: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_owned(), MockEntry::Failure);
    }

    /// Removes the configuration for a URL
    pub fn remove(&self, url: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }
}

#[async_trait]
impl UrlAsyncFetcher for MockUrlFetcher {
    async fn fetch(
        &self,
        url: &str,
        _request_headers: &HeaderMap,
    ) -> Result<FetchResponse, Box<Error>> {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned();
        trace!("mock fetch of {url}: {entry:?}");
        match entry {
            Some(MockEntry::Response(response)) => Ok(response),
            Some(MockEntry::Failure) => Err(Error::explain(
                ErrorType::ConnectError,
                format!("mock failure for {url}"),
            )),
            None => Ok(FetchResponse::not_found()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn canned_responses() {
        let fetcher = MockUrlFetcher::new();
        fetcher.set_text("http://test.com/a.css", "text/css", " a ", 100);
        fetcher.set_failure("http://test.com/broken.css");

        let response = fetcher
            .fetch("http://test.com/a.css", &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, " a ");
        assert_eq!(
            response.headers.get(header::CACHE_CONTROL).unwrap(),
            "max-age=100"
        );

        let response = fetcher
            .fetch("http://test.com/missing.css", &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        assert!(fetcher
            .fetch("http://test.com/broken.css", &HeaderMap::new())
            .await
            .is_err());

        fetcher.remove("http://test.com/a.css");
        let response = fetcher
            .fetch("http://test.com/a.css", &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
