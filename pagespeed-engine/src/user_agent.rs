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

//! Request-dependent properties that influence how resources are optimized.

use http::{header, HeaderMap};

/// Capabilities of the client making a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgentInfo {
    /// Raw `User-Agent` header
    pub user_agent: String,
    /// Client announced WebP support in its `Accept` header
    pub accepts_webp: bool,
    /// Client appears to be a mobile device
    pub is_mobile: bool,
}

impl UserAgentInfo {
    /// Derives capabilities from request headers
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let accepts_webp = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.contains("image/webp"));
        let is_mobile = user_agent.contains("Mobile") || user_agent.contains("Android");
        Self {
            user_agent,
            accepts_webp,
            is_mobile,
        }
    }
}

/// The subset of request properties a filter's output depends on. It becomes part of the
/// partition key, so that requests with different properties get different results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResourceContext {
    /// Output may use WebP
    pub webp: bool,
    /// Output targets small screens
    pub small_screen: bool,
    /// Desired image dimensions
    pub dimensions: Option<(u32, u32)>,
}

impl ResourceContext {
    /// Encodes the context for use in cache keys
    pub fn cache_key(&self) -> String {
        let mut result = String::new();
        if self.webp {
            result.push('w');
        }
        if self.small_screen {
            result.push('s');
        }
        if let Some((width, height)) = self.dimensions {
            result.push_str(&format!("d{width}x{height}"));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn capabilities_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (Linux; Android 10) Mobile Safari/537.36"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,*/*"),
        );
        let info = UserAgentInfo::from_headers(&headers);
        assert!(info.accepts_webp);
        assert!(info.is_mobile);

        let info = UserAgentInfo::from_headers(&HeaderMap::new());
        assert_eq!(info, UserAgentInfo::default());
    }

    #[test]
    fn cache_key() {
        assert_eq!(ResourceContext::default().cache_key(), "");
        let context = ResourceContext {
            webp: true,
            small_screen: false,
            dimensions: Some((32, 48)),
        };
        assert_eq!(context.cache_key(), "wd32x48");
    }
}
