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
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use pingora_error::{Error, ErrorType};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{ttl_ms, CacheInterface, CacheStats};
use crate::timer::{system_time_ms, Timer};

const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');
const MAX_FILE_NAME: usize = 200;
const TEMP_MARKER: &str = ".tmp-";

/// Fraction of the configured limits a cleaning pass shrinks the cache to, in percent
const CLEAN_TARGET_PERCENT: u64 = 75;

/// Limits enforced by periodic cleaning of a [`FileCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanPolicy {
    /// Minimal time between two cleaning passes
    pub interval_ms: i64,
    /// Maximal total size of the cache files in bytes, 0 for no limit
    pub max_size: u64,
    /// Maximal number of cache files, 0 for no limit
    pub max_files: u64,
}

/// Cache storing each value in a file of its own
#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
    policy: CleanPolicy,
    timer: Arc<dyn Timer>,
    next_clean_ms: AtomicI64,
    cleaning: AtomicBool,
    temp_counter: AtomicU64,
    stats: CacheStats,
}

impl FileCache {
    /// Creates a cache in the given directory, the directory is created on first write.
    pub fn new(root: impl Into<PathBuf>, policy: CleanPolicy, timer: Arc<dyn Timer>) -> Self {
        let next_clean_ms = AtomicI64::new(timer.now_ms().saturating_add(policy.interval_ms));
        Self {
            root: root.into(),
            policy,
            timer,
            next_clean_ms,
            cleaning: AtomicBool::new(false),
            temp_counter: AtomicU64::new(0),
            stats: Default::default(),
        }
    }

    /// Operation counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = utf8_percent_encode(key, FILE_NAME).to_string();
        if name.len() <= MAX_FILE_NAME {
            self.root.join(name)
        } else {
            self.root
                .join(format!("h_{}", URL_SAFE_NO_PAD.encode(Sha256::digest(key))))
        }
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
        tokio::fs::create_dir_all(&self.root).await?;
        let temp = path.with_file_name(format!(
            "{}{TEMP_MARKER}{}",
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, path).await
    }

    /// Removes the least recently written files until the cache is below 75% of its limits.
    /// Returns the number of files removed.
    pub async fn clean(&self) -> Result<usize, Box<Error>> {
        if self.policy.max_size == 0 && self.policy.max_files == 0 {
            return Ok(0);
        }

        let mut files = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(Error::because(
                    ErrorType::FileReadError,
                    format!("failed reading cache directory {}", self.root.display()),
                    err,
                ))
            }
        };
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    return Err(Error::because(
                        ErrorType::FileReadError,
                        "failed listing cache directory",
                        err,
                    ))
                }
            };
            if entry.file_name().to_string_lossy().contains(TEMP_MARKER) {
                continue;
            }
            if let Ok(metadata) = entry.metadata().await {
                if metadata.is_file() {
                    let modified = metadata.modified().map(system_time_ms).unwrap_or(0);
                    files.push((modified, metadata.len(), entry.path()));
                }
            }
        }

        let mut total_size = files.iter().map(|(_, size, _)| size).sum::<u64>();
        let mut total_files = files.len() as u64;
        let over_size = self.policy.max_size > 0 && total_size > self.policy.max_size;
        let over_files = self.policy.max_files > 0 && total_files > self.policy.max_files;
        if !over_size && !over_files {
            return Ok(0);
        }

        let target_size = self.policy.max_size * CLEAN_TARGET_PERCENT / 100;
        let target_files = self.policy.max_files * CLEAN_TARGET_PERCENT / 100;
        files.sort();

        let mut removed = 0;
        for (_, size, path) in files {
            let size_ok = self.policy.max_size == 0 || total_size <= target_size;
            let files_ok = self.policy.max_files == 0 || total_files <= target_files;
            if size_ok && files_ok {
                break;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    total_size -= size;
                    total_files -= 1;
                    self.stats.record_eviction();
                }
                Err(err) => warn!("failed removing cache file {}: {err}", path.display()),
            }
        }
        info!(
            "cleaned file cache {}, removed {removed} files",
            self.root.display()
        );
        Ok(removed)
    }

    async fn maybe_clean(&self) {
        let now = self.timer.now_ms();
        if now < self.next_clean_ms.load(Ordering::Relaxed)
            || self.cleaning.swap(true, Ordering::AcqRel)
        {
            return;
        }
        self.next_clean_ms.store(
            now.saturating_add(self.policy.interval_ms),
            Ordering::Relaxed,
        );
        if let Err(err) = self.clean().await {
            warn!("{err}");
        }
        self.cleaning.store(false, Ordering::Release);
    }
}

#[async_trait]
impl CacheInterface for FileCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!("failed reading cache file {}: {err}", path.display());
                }
                self.stats.record_miss();
                return None;
            }
        };

        let expires_at_ms = data
            .get(..8)
            .and_then(|header| header.try_into().ok())
            .map(i64::from_be_bytes);
        match expires_at_ms {
            Some(expires_at_ms) if expires_at_ms > self.timer.now_ms() => {
                self.stats.record_hit();
                Some(Bytes::from(data).slice(8..))
            }
            Some(_) => {
                debug!("cache file {} expired", path.display());
                let _ = tokio::fs::remove_file(&path).await;
                self.stats.record_eviction();
                self.stats.record_miss();
                None
            }
            None => {
                warn!("truncated cache file {}", path.display());
                self.stats.record_miss();
                None
            }
        }
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let expires_at_ms = ttl_ms(ttl)
            .map(|ttl| self.timer.now_ms().saturating_add(ttl))
            .unwrap_or(i64::MAX);
        let mut data = BytesMut::with_capacity(value.len() + 8);
        data.put_i64(expires_at_ms);
        data.put(value);

        let path = self.path_for(key);
        match self.write(&path, &data).await {
            Ok(()) => self.stats.record_insert(),
            Err(err) => warn!("failed writing cache file {}: {err}", path.display()),
        }
        self.maybe_clean().await;
    }

    async fn delete(&self, key: &str) {
        let path = self.path_for(key);
        if tokio::fs::remove_file(&path).await.is_ok() {
            self.stats.record_delete();
        }
    }

    fn name(&self) -> &'static str {
        "FileCache"
    }
}
