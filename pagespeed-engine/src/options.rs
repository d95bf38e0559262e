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

//! Settings of the rewrite engine

use serde::Deserialize;
use std::path::PathBuf;

use crate::fetch::FileLoadMapping;

/// Rewrite engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RewriteOptions {
    /// Ids of the filters to apply to HTML documents, in the order they should run.
    pub enabled_filters: Vec<String>,

    /// How long an HTML flush waits for rewrites to complete, in milliseconds. Rewrites that
    /// take longer still complete in the background but don't change the current document.
    pub render_deadline_ms: u64,

    /// How long a request for a rewritten resource may take before the unoptimized input is
    /// served instead, in milliseconds. Only applies to filters that merely optimize.
    pub fetch_deadline_ms: u64,

    /// Maximal size of a combined resource in bytes.
    pub max_combined_bytes: u64,

    /// Maximal length of the name segment of a rewritten URL.
    pub max_url_segment_size: usize,

    /// Maximal size of an input that will be rewritten, in bytes.
    pub max_input_bytes: u64,

    /// Length of content hashes in rewritten URLs.
    pub hash_length: usize,

    /// Size of the in-memory cache in kilobytes.
    pub lru_cache_kb: usize,

    /// Directory of the file cache. If set, the in-memory cache becomes the first level of a
    /// two-level cache.
    pub file_cache_path: Option<PathBuf>,

    /// Minimal interval between two cleaning passes of the file cache, in milliseconds.
    pub file_cache_clean_interval_ms: i64,

    /// Size the file cache is cleaned down to, in kilobytes. 0 disables size-based cleaning.
    pub file_cache_clean_size_kb: u64,

    /// Number of files the file cache is cleaned down to. 0 disables count-based cleaning.
    pub file_cache_clean_inode_limit: u64,

    /// Share rewrite locks with all engines of this process rather than using engine-local
    /// locks.
    pub use_shared_mem_locking: bool,

    /// Rewrite resources even if their responses are not cacheable. The results are not
    /// recorded in the metadata cache.
    pub rewrite_uncacheable: bool,

    /// Inputs expiring within this many milliseconds are refreshed in the background when a
    /// cached result is used.
    pub freshen_margin_ms: i64,

    /// How long a rewrite may hold its lock before others can take over, in milliseconds.
    pub rewrite_lock_ttl_ms: u64,

    /// How long an HTML rewrite waits for a lock held by a concurrent rewrite of the same
    /// resources, in milliseconds.
    pub lock_wait_ms: u64,

    /// Number of rewrites running concurrently.
    pub rewrite_worker_threads: usize,

    /// Number of concurrent rewrites for requests that no longer wait for them.
    pub low_priority_worker_threads: usize,

    /// Number of queued low-priority rewrites beyond which further ones are abandoned.
    pub max_low_priority_queue_depth: usize,

    /// Maximal number of concurrent fetches per host.
    pub max_fetches_per_host: usize,

    /// Number of fetches per host that may wait for a free slot, further fetches fail.
    pub fetch_queue_size: usize,

    /// Timeout of a single fetch in milliseconds.
    pub fetcher_timeout_ms: u64,

    /// Freshness lifetime of responses without caching headers, in milliseconds.
    pub implicit_cache_ttl_ms: i64,

    /// How long fetch failures are remembered, in milliseconds. Also the lifetime of results
    /// recording that inputs could not be fetched.
    pub failure_cache_ttl_ms: i64,

    /// Serve resources at their original URLs optimized once an optimized version is known.
    pub in_place_rewriting: bool,

    /// Input URLs that are read from the filesystem rather than fetched.
    pub file_load: Vec<FileLoadMapping>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            enabled_filters: Vec::new(),
            render_deadline_ms: 10,
            fetch_deadline_ms: 5_000,
            max_combined_bytes: 1024 * 1024,
            max_url_segment_size: 1024,
            max_input_bytes: 10 * 1024 * 1024,
            hash_length: 10,
            lru_cache_kb: 16 * 1024,
            file_cache_path: None,
            file_cache_clean_interval_ms: 60 * 60 * 1000,
            file_cache_clean_size_kb: 100 * 1024,
            file_cache_clean_inode_limit: 0,
            use_shared_mem_locking: false,
            rewrite_uncacheable: false,
            freshen_margin_ms: 60 * 1000,
            rewrite_lock_ttl_ms: 30 * 1000,
            lock_wait_ms: 100,
            rewrite_worker_threads: 4,
            low_priority_worker_threads: 1,
            max_low_priority_queue_depth: 100,
            max_fetches_per_host: 8,
            fetch_queue_size: 64,
            fetcher_timeout_ms: 5_000,
            implicit_cache_ttl_ms: 5 * 60 * 1000,
            failure_cache_ttl_ms: 5 * 60 * 1000,
            in_place_rewriting: false,
            file_load: Vec::new(),
        }
    }
}

impl RewriteOptions {
    /// Checks whether a filter is enabled
    pub fn is_enabled(&self, id: &str) -> bool {
        self.enabled_filters.iter().any(|enabled| enabled == id)
    }
}
