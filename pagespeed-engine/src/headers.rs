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

//! HTTP caching semantics for inputs and the headers of served outputs.

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use httpdate::{fmt_http_date, parse_http_date};

use crate::timer::{ms_to_system_time, system_time_ms};

/// Lifetime of versioned (hash-carrying) URLs
pub(crate) const ONE_YEAR_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Caching properties derived from response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CachePolicy {
    pub(crate) cacheable: bool,
    pub(crate) date_ms: i64,
    pub(crate) expiration_ms: i64,
    pub(crate) last_modified_ms: Option<i64>,
}

pub(crate) fn parse_date_header(headers: &HeaderMap, name: header::HeaderName) -> Option<i64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_http_date(value).ok())
        .map(system_time_ms)
}

pub(crate) fn http_date(ms: i64) -> String {
    fmt_http_date(ms_to_system_time(ms))
}

fn max_age_ms(cache_control: &str) -> Option<i64> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| {
            let (name, value) = directive.split_once('=')?;
            if name.trim().eq_ignore_ascii_case("max-age") {
                value.trim().trim_matches('"').parse::<i64>().ok()
            } else {
                None
            }
        })
        .map(|seconds| seconds.saturating_mul(1000))
}

/// Determines whether a response may be cached and until when. Responses without any explicit
/// caching headers are cached for `implicit_ttl_ms`.
pub(crate) fn cache_policy(
    status: StatusCode,
    headers: &HeaderMap,
    now_ms: i64,
    implicit_ttl_ms: i64,
) -> CachePolicy {
    let date_ms = parse_date_header(headers, header::DATE).unwrap_or(now_ms);
    let last_modified_ms = parse_date_header(headers, header::LAST_MODIFIED);

    let cache_control = headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(",")
        .to_ascii_lowercase();
    let pragma_no_cache = headers
        .get(header::PRAGMA)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("no-cache"));

    let forbidden = cache_control
        .split(',')
        .map(str::trim)
        .any(|directive| matches!(directive, "no-store" | "no-cache" | "private"));

    let expiration_ms = if let Some(max_age) = max_age_ms(&cache_control) {
        date_ms.saturating_add(max_age)
    } else if let Some(expires) = headers.get(header::EXPIRES) {
        expires
            .to_str()
            .ok()
            .and_then(|value| parse_http_date(value).ok())
            .map(system_time_ms)
            .unwrap_or(date_ms)
    } else {
        date_ms.saturating_add(implicit_ttl_ms)
    };

    CachePolicy {
        cacheable: status == StatusCode::OK
            && !forbidden
            && !pragma_no_cache
            && expiration_ms > now_ms,
        date_ms,
        expiration_ms,
        last_modified_ms,
    }
}

/// Removes cookies, these must never be replayed from a shared cache.
pub(crate) fn strip_cookies(headers: &mut HeaderMap) {
    headers.remove(header::SET_COOKIE);
    headers.remove("set-cookie2");
}

/// Checks `If-None-Match` request header against an ETag value.
pub(crate) fn etag_matches(request_headers: &HeaderMap, etag: &str) -> bool {
    request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value == "*" || value.split(',').map(str::trim).any(|value| value == etag)
        })
}

pub(crate) fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Headers of a response that may be cached by anyone for a year
pub(crate) fn set_long_lived(headers: &mut HeaderMap, now_ms: i64) {
    insert_header(headers, header::DATE, &http_date(now_ms));
    insert_header(
        headers,
        header::EXPIRES,
        &http_date(now_ms.saturating_add(ONE_YEAR_MS)),
    );
    insert_header(
        headers,
        header::CACHE_CONTROL,
        &format!("max-age={}", ONE_YEAR_MS / 1000),
    );
}

/// Headers of a response that must only be cached briefly and privately
pub(crate) fn set_short_private(headers: &mut HeaderMap, now_ms: i64, ttl_ms: i64) {
    headers.remove(header::EXPIRES);
    headers.remove(header::ETAG);
    insert_header(headers, header::DATE, &http_date(now_ms));
    insert_header(
        headers,
        header::CACHE_CONTROL,
        &format!("max-age={},private", ttl_ms / 1000),
    );
}

/// A response produced by one of the engine's serving entry points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedResource {
    /// Response status
    pub status: StatusCode,
    /// Response headers, `Content-Length` excluded
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl ServedResource {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub(crate) fn not_modified(etag: &str, now_ms: i64) -> Self {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, header::ETAG, etag);
        set_long_lived(&mut headers, now_ms);
        Self::new(StatusCode::NOT_MODIFIED, headers, Bytes::new())
    }

    pub(crate) fn redirect(location: &str, now_ms: i64, ttl_ms: i64) -> Self {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, header::LOCATION, location);
        set_short_private(&mut headers, now_ms, ttl_ms);
        Self::new(StatusCode::FOUND, headers, Bytes::new())
    }

    /// Value of a response header if it is valid UTF-8
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}
