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

//! Fetching of input resources from their origin.
//!
//! The engine consumes origins through the [`UrlAsyncFetcher`] trait. The implementations in
//! this module are wrappers adding behavior to another fetcher (counting, holding back
//! responses, limiting concurrency) and a mock fetcher with canned responses.

mod counting;
mod file_load;
mod mock;
mod rate_control;
mod wait;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use pingora_error::{Error, ErrorType};
use std::fmt::Debug;

pub use counting::CountingUrlFetcher;
pub use file_load::{FileLoadMapping, FileLoadPolicy};
pub use mock::MockUrlFetcher;
pub use rate_control::RateControllingFetcher;
pub use wait::WaitUrlFetcher;

pub(crate) use file_load::file_mtime_ms;

/// A response received from an origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl FetchResponse {
    /// Creates a response
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// An empty 404 Not Found response
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new())
    }
}

/// Asynchronous HTTP client interface
#[async_trait]
pub trait UrlAsyncFetcher: Debug + Send + Sync {
    /// Fetches a URL. Error responses from the origin are returned as `Ok`, `Err` means that no
    /// response could be received.
    async fn fetch(
        &self,
        url: &str,
        request_headers: &HeaderMap,
    ) -> Result<FetchResponse, Box<Error>>;
}

/// A fetcher that never succeeds, for setups where all inputs are local
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUrlFetcher;

#[async_trait]
impl UrlAsyncFetcher for NullUrlFetcher {
    async fn fetch(
        &self,
        url: &str,
        _request_headers: &HeaderMap,
    ) -> Result<FetchResponse, Box<Error>> {
        Err(Error::explain(
            ErrorType::ConnectRefused,
            format!("fetching {url} is not supported"),
        ))
    }
}
