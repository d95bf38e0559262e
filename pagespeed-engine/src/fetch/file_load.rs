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

//! Loading of inputs from the filesystem instead of their origin

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::timer::system_time_ms;

/// Maps URLs starting with a prefix to files in a directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileLoadMapping {
    /// URL prefix, e.g. `http://example.com/static/`
    pub url_prefix: String,
    /// Directory the files under the prefix are located in
    pub directory: PathBuf,
}

/// The set of URL prefixes to be loaded from the filesystem
#[derive(Debug, Clone, Default)]
pub struct FileLoadPolicy {
    mappings: Vec<FileLoadMapping>,
}

impl FileLoadPolicy {
    /// Creates a policy, longer prefixes take precedence
    pub fn new(mut mappings: Vec<FileLoadMapping>) -> Self {
        mappings.sort_by(|a, b| b.url_prefix.len().cmp(&a.url_prefix.len()));
        Self { mappings }
    }

    /// Resolves a URL to a file path. `None` if no mapping applies or the path would leave the
    /// mapped directory.
    pub fn file_for(&self, url: &str) -> Option<PathBuf> {
        let url = url.split(['?', '#']).next().unwrap_or_default();
        let mapping = self
            .mappings
            .iter()
            .find(|mapping| url.starts_with(&mapping.url_prefix))?;

        let mut path = mapping.directory.clone();
        for component in url[mapping.url_prefix.len()..].split('/') {
            let decoded = percent_decode_str(component).decode_utf8().ok()?;
            if decoded.is_empty() || decoded == "." {
                continue;
            }
            if decoded == ".." || decoded.contains(['/', '\\', '\0']) {
                return None;
            }
            path.push(decoded.as_ref());
        }
        (path != mapping.directory).then_some(path)
    }
}

/// Modification time of a file in milliseconds since the epoch
pub(crate) async fn file_mtime_ms(path: &Path) -> Option<i64> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    metadata.modified().ok().map(system_time_ms)
}
