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

//! Names of rewritten resources: `<name>.pagespeed.<filter-id>.<hash>.<ext>`

use url::Url;

const MARKER: &str = ".pagespeed.";

/// Decoded leaf name of a rewritten resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNamer {
    /// Encoded inputs, including any encoder data prefix
    pub name: String,
    /// Filter id
    pub id: String,
    /// Hash of the output contents
    pub hash: String,
    /// File extension
    pub ext: String,
}

impl ResourceNamer {
    /// Produces the leaf name
    pub fn encode(&self) -> String {
        format!("{}{MARKER}{}.{}.{}", self.name, self.id, self.hash, self.ext)
    }

    /// Parses a leaf name, `None` if it doesn't have the expected structure.
    pub fn decode(leaf: &str) -> Option<Self> {
        let position = leaf.rfind(MARKER)?;
        let name = &leaf[..position];
        let mut parts = leaf[position + MARKER.len()..].splitn(3, '.');
        let id = parts.next()?;
        let hash = parts.next()?;
        let ext = parts.next()?;

        let valid_part = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        };
        if name.is_empty() || !valid_part(id) || !valid_part(hash) || !valid_part(ext) {
            return None;
        }

        Some(Self {
            name: name.to_owned(),
            id: id.to_owned(),
            hash: hash.to_owned(),
            ext: ext.to_owned(),
        })
    }

    /// Same name with a different hash
    pub fn with_hash(&self, hash: &str) -> Self {
        Self {
            hash: hash.to_owned(),
            ..self.clone()
        }
    }
}

/// Checks quickly whether a URL might be a rewritten resource.
pub fn is_rewritten_url(url: &str) -> bool {
    url.contains(MARKER)
}

/// Splits a rewritten URL into the URL of its directory and the decoded leaf.
pub fn split_rewritten_url(url: &Url) -> Option<(Url, ResourceNamer)> {
    if url.query().is_some() {
        return None;
    }
    let leaf = url.path_segments()?.last()?;
    let namer = ResourceNamer::decode(leaf)?;
    Some((directory_of(url), namer))
}

/// Expresses `url` relative to the directory `base` if it is located within it, otherwise
/// returns the absolute URL.
pub fn relative_url(base: &Url, url: &str) -> String {
    match url.strip_prefix(base.as_str()) {
        Some(relative) if !relative.is_empty() => relative.to_owned(),
        _ => url.to_owned(),
    }
}

/// The directory of a URL
pub fn directory_of(url: &Url) -> Url {
    url.join("./").unwrap_or_else(|_| url.clone())
}
