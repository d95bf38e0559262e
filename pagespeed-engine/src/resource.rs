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

//! Resources: fetchable documents identified by URL, along with their freshness records.

use bytes::Bytes;
use http::{header, HeaderMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::content_type::ContentType;
use crate::partitions::{InputInfo, InputKind};

/// Index of a resource in a driver's resource arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) usize);

/// Why a resource could not be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailure {
    /// The origin responded with an error or the fetch failed
    FetchFailed,
    /// A previous fetch failure is still remembered by the HTTP cache
    RecentlyFailed,
    /// The response must not be cached and rewriting uncacheable resources is disabled
    Uncacheable,
    /// The response exceeds the configured size limit
    TooLarge,
    /// Too many fetches are outstanding for the origin
    TooBusy,
    /// The engine is shutting down
    Shutdown,
}

/// Loading state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Nobody attempted loading the resource yet
    NotLoaded,
    /// A fetch is in progress
    Loading,
    /// Contents are available
    Loaded,
    /// Loading failed
    Failed(LoadFailure),
}

/// Freshness record of a loaded resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Freshness {
    /// Date of the response in milliseconds since the epoch
    pub date_ms: i64,
    /// Time at which the response stops being fresh
    pub expiration_ms: i64,
    /// Last modification time of the response, if known
    pub last_modified_ms: Option<i64>,
    /// Hash of the contents
    pub content_hash: Option<String>,
    /// Whether the response may be cached
    pub cacheable: bool,
}

/// A resource, either an input of a rewrite or its output
#[derive(Debug, Clone)]
pub struct Resource {
    url: String,
    content_type: Option<ContentType>,
    state: LoadState,
    headers: HeaderMap,
    contents: Bytes,
    freshness: Freshness,
    file_path: Option<PathBuf>,
}

impl Resource {
    /// Creates a resource that hasn't been loaded yet
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let content_type = ContentType::from_path(&url);
        Self {
            url,
            content_type,
            state: LoadState::NotLoaded,
            headers: HeaderMap::new(),
            contents: Bytes::new(),
            freshness: Freshness::default(),
            file_path: None,
        }
    }

    /// Creates a loaded resource from a successful response
    pub fn loaded(
        url: impl Into<String>,
        headers: HeaderMap,
        contents: impl Into<Bytes>,
        freshness: Freshness,
    ) -> Self {
        let mut resource = Self::new(url);
        if let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            resource.content_type = Some(ContentType::from_mime(content_type));
        }
        resource.state = LoadState::Loaded;
        resource.headers = headers;
        resource.contents = contents.into();
        resource.freshness = freshness;
        resource
    }

    /// Creates a resource representing a failed load
    pub fn failed(url: impl Into<String>, failure: LoadFailure) -> Self {
        let mut resource = Self::new(url);
        resource.state = LoadState::Failed(failure);
        resource
    }

    /// The absolute URL of this resource
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Content type of the response, falling back to a guess based on the URL
    pub fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    /// Response contents, empty unless loaded
    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    /// Contents as text, invalid UTF-8 sequences replaced
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.contents)
    }

    /// Response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Current loading state
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Whether contents are available
    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    /// Freshness information, meaningful only once loaded
    pub fn freshness(&self) -> &Freshness {
        &self.freshness
    }

    /// File the resource was read from if it was loaded from the filesystem
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub(crate) fn set_file_path(&mut self, path: PathBuf) {
        self.file_path = Some(path);
    }

    pub(crate) fn set_state(&mut self, state: LoadState) {
        self.state = state;
    }

    pub(crate) fn set_content_type(&mut self, content_type: ContentType) {
        self.content_type = Some(content_type);
    }

    pub(crate) fn set_content_hash(&mut self, hash: String) {
        self.freshness.content_hash = Some(hash);
    }

    /// Produces the revalidation record for this resource as input number `index`. The content
    /// hash is only recorded if `include_hash` is set.
    pub(crate) fn input_info(&self, index: usize, include_hash: bool) -> InputInfo {
        let kind = if self.file_path.is_some() {
            InputKind::File
        } else if self.freshness.cacheable {
            InputKind::Cache
        } else {
            InputKind::Uncacheable
        };
        InputInfo {
            kind,
            index,
            date_ms: self.freshness.date_ms,
            expiration_ms: self.freshness.expiration_ms,
            last_modified_ms: self.freshness.last_modified_ms,
            content_hash: if include_hash {
                self.freshness.content_hash.clone()
            } else {
                None
            },
            filename: self
                .file_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
            url: None,
        }
    }
}

/// Owner of all resources referenced during a single driver's lifetime, keyed by URL
#[derive(Debug, Default)]
pub(crate) struct ResourceArena {
    resources: Vec<Resource>,
    by_url: HashMap<String, ResourceId>,
}

impl ResourceArena {
    /// Returns the resource for a URL, creating it if necessary.
    pub(crate) fn get_or_create(&mut self, url: &str) -> ResourceId {
        if let Some(id) = self.by_url.get(url) {
            return *id;
        }
        self.insert(Resource::new(url))
    }

    /// Adds a resource, replacing the URL mapping of any previous resource with the same URL.
    pub(crate) fn insert(&mut self, resource: Resource) -> ResourceId {
        let id = ResourceId(self.resources.len());
        self.by_url.insert(resource.url.clone(), id);
        self.resources.push(resource);
        id
    }

    pub(crate) fn get(&self, id: ResourceId) -> &Resource {
        &self.resources[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: ResourceId) -> &mut Resource {
        &mut self.resources[id.0]
    }

    pub(crate) fn find(&self, url: &str) -> Option<ResourceId> {
        self.by_url.get(url).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn content_type_from_headers_and_url() {
        let resource = Resource::new("http://test.com/a.css");
        assert_eq!(resource.content_type(), Some(&ContentType::css()));
        assert!(!resource.is_loaded());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/javascript"),
        );
        let resource = Resource::loaded(
            "http://test.com/a.css",
            headers,
            "var a;",
            Freshness::default(),
        );
        assert_eq!(resource.content_type(), Some(&ContentType::javascript()));
        assert!(resource.is_loaded());
        assert_eq!(resource.text(), "var a;");
    }

    #[test]
    fn input_info_kinds() {
        let mut resource = Resource::loaded(
            "http://test.com/a.css",
            HeaderMap::new(),
            "a",
            Freshness {
                date_ms: 1,
                expiration_ms: 2,
                last_modified_ms: Some(0),
                content_hash: Some("hash".into()),
                cacheable: true,
            },
        );
        let info = resource.input_info(3, true);
        assert_eq!(info.kind, InputKind::Cache);
        assert_eq!(info.index, 3);
        assert_eq!(info.content_hash.as_deref(), Some("hash"));
        assert_eq!(resource.input_info(3, false).content_hash, None);

        resource.set_file_path(PathBuf::from("/tmp/a.css"));
        assert_eq!(resource.input_info(0, true).kind, InputKind::File);

        let resource = Resource::loaded(
            "http://test.com/b.css",
            HeaderMap::new(),
            "b",
            Freshness::default(),
        );
        assert_eq!(resource.input_info(0, true).kind, InputKind::Uncacheable);
    }

    #[test]
    fn arena_deduplicates_urls() {
        let mut arena = ResourceArena::default();
        let a = arena.get_or_create("http://test.com/a.css");
        let b = arena.get_or_create("http://test.com/b.css");
        assert_ne!(a, b);
        assert_eq!(arena.get_or_create("http://test.com/a.css"), a);
        assert_eq!(arena.find("http://test.com/b.css"), Some(b));
        assert_eq!(arena.get(b).url(), "http://test.com/b.css");
    }
}
