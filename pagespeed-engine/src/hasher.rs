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

//! Content hashes embedded into rewritten URLs and hashed cache keys.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use std::fmt::Debug;

/// Produces URL-safe hashes of byte strings
pub trait Hasher: Debug + Send + Sync {
    /// Hashes the data, the result may only contain URL-safe characters and no dots.
    fn hash(&self, data: &[u8]) -> String;

    /// Produces a cache key from a number of fragments, with a readable prefix.
    fn cache_key(&self, prefix: &str, fragments: &[&str]) -> String {
        let mut digest = Sha256::new();
        for fragment in fragments {
            digest.update(fragment.as_bytes());
            digest.update([0]);
        }
        format!("{prefix}_{}", URL_SAFE_NO_PAD.encode(digest.finalize()))
    }
}

/// SHA-256 based hasher truncating the result to a configurable length
#[derive(Debug, Clone)]
pub struct Sha256Hasher {
    length: usize,
}

impl Sha256Hasher {
    /// Creates a hasher producing hashes of the given length (at most 43 characters)
    pub fn new(length: usize) -> Self {
        Self {
            length: length.clamp(1, 43),
        }
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Hasher for Sha256Hasher {
    fn hash(&self, data: &[u8]) -> String {
        let mut result = URL_SAFE_NO_PAD.encode(Sha256::digest(data));
        result.truncate(self.length);
        result
    }
}

/// A hasher returning a constant, making rewritten URLs predictable in tests
#[derive(Debug, Clone)]
pub struct MockHasher {
    value: String,
}

impl MockHasher {
    /// Creates a hasher that always returns `value`
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl Default for MockHasher {
    fn default() -> Self {
        Self::new("0")
    }
}

impl Hasher for MockHasher {
    fn hash(&self, _data: &[u8]) -> String {
        self.value.clone()
    }
}
