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

//! The engine: state shared by all rewrites of a process and the entry points of the request
//! flows. HTML documents are rewritten by drivers created with [`Engine::new_driver`],
//! rewritten resources are reconstructed by [`Engine::fetch_resource`] and resources are
//! optimized at their original URL by [`Engine::fetch_in_place`].

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use log::{debug, info, trace, warn};
use pingora_error::{Error, ErrorType};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use url::Url;

use crate::cache::{
    CacheInterface, CleanPolicy, FileCache, HttpCache, HttpCacheLookup, HttpValue, LruCache,
    WriteThroughCache,
};
use crate::content_type::ContentType;
use crate::driver::RewriteDriver;
use crate::fetch::{
    file_mtime_ms, FileLoadPolicy, NullUrlFetcher, RateControllingFetcher, UrlAsyncFetcher,
};
use crate::filter::RewriteFilter;
use crate::filters;
use crate::hasher::{Hasher, Sha256Hasher};
use crate::headers::{cache_policy, parse_date_header, CachePolicy};
use crate::lock::{LockManager, MemLockManager};
use crate::namer::{
    directory_of, is_rewritten_url, relative_url, split_rewritten_url, ResourceNamer,
};
use crate::options::RewriteOptions;
use crate::resource::{Freshness, LoadFailure, Resource};
use crate::stats::Statistics;
use crate::timer::{SystemTimer, Timer};
use crate::user_agent::ResourceContext;
use crate::workers::{WorkerPool, TOO_BUSY};

/// A boxed future producing a loaded (or failed) resource
pub(crate) type LoadFuture = Pin<Box<dyn Future<Output = Resource> + Send>>;

/// Whether loading an input may use the HTTP cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadMode {
    /// Use a fresh HTTP cache entry if there is one
    Cached,
    /// Always go to the origin, used to revalidate expired inputs
    Fresh,
}

#[derive(Debug)]
pub(crate) struct EngineInner {
    pub(crate) options: Arc<RewriteOptions>,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) hasher: Arc<dyn Hasher>,
    pub(crate) metadata_cache: Arc<dyn CacheInterface>,
    pub(crate) http_cache: HttpCache,
    pub(crate) fetcher: Arc<dyn UrlAsyncFetcher>,
    pub(crate) lock_manager: Arc<dyn LockManager>,
    pub(crate) file_load: FileLoadPolicy,
    pub(crate) filters: HashMap<&'static str, Arc<dyn RewriteFilter>>,
    pub(crate) rewrite_pool: WorkerPool,
    pub(crate) low_priority_pool: WorkerPool,
    pub(crate) stats: Statistics,
    shutdown: watch::Sender<bool>,
    background: Mutex<JoinSet<()>>,
}

/// Handle to the rewrite engine, cheap to clone
#[derive(Debug, Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

/// Sets up an [`Engine`]. Collaborators that aren't set explicitly are derived from the
/// options: an LRU cache (backed by a file cache if `file_cache_path` is set) shared by the
/// metadata and HTTP caches, a SHA-256 hasher, the system clock and an in-process lock manager.
#[derive(Debug)]
pub struct EngineBuilder {
    options: RewriteOptions,
    timer: Arc<dyn Timer>,
    hasher: Option<Arc<dyn Hasher>>,
    cache: Option<Arc<dyn CacheInterface>>,
    metadata_cache: Option<Arc<dyn CacheInterface>>,
    fetcher: Arc<dyn UrlAsyncFetcher>,
    lock_manager: Option<Arc<dyn LockManager>>,
    filters: Vec<Arc<dyn RewriteFilter>>,
}

impl EngineBuilder {
    /// Starts building an engine with the given options
    pub fn new(options: RewriteOptions) -> Self {
        Self {
            options,
            timer: Arc::new(SystemTimer),
            hasher: None,
            cache: None,
            metadata_cache: None,
            fetcher: Arc::new(NullUrlFetcher),
            lock_manager: None,
            filters: Vec::new(),
        }
    }

    /// Clock used for expiration times
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Hasher for content hashes and cache keys
    pub fn hasher(mut self, hasher: Arc<dyn Hasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Backend of the HTTP cache, also used for metadata unless a separate metadata cache is set
    pub fn cache(mut self, cache: Arc<dyn CacheInterface>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Backend of the metadata cache
    pub fn metadata_cache(mut self, cache: Arc<dyn CacheInterface>) -> Self {
        self.metadata_cache = Some(cache);
        self
    }

    /// Fetcher retrieving inputs from their origin
    pub fn fetcher(mut self, fetcher: Arc<dyn UrlAsyncFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Lock manager coordinating rewrites of the same partition key
    pub fn lock_manager(mut self, lock_manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(lock_manager);
        self
    }

    /// Registers a filter
    pub fn filter(mut self, filter: Arc<dyn RewriteFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Registers the filters shipped with the engine
    pub fn with_default_filters(mut self) -> Self {
        let max_bytes = self.options.max_combined_bytes;
        let max_segment = self.options.max_url_segment_size;
        self.filters.extend(filters::default_filters(max_bytes, max_segment));
        self
    }

    /// Creates the engine. Fails if two filters share an id or an enabled filter is unknown.
    pub fn build(self) -> Result<Engine, Box<Error>> {
        let options = self.options;
        let timer = self.timer;

        let cache = self.cache.unwrap_or_else(|| {
            let lru: Arc<dyn CacheInterface> = Arc::new(LruCache::new(
                options.lru_cache_kb.saturating_mul(1024),
                timer.clone(),
            ));
            match &options.file_cache_path {
                Some(path) => {
                    let policy = CleanPolicy {
                        interval_ms: options.file_cache_clean_interval_ms,
                        max_size: options.file_cache_clean_size_kb.saturating_mul(1024),
                        max_files: options.file_cache_clean_inode_limit,
                    };
                    let file = Arc::new(FileCache::new(path, policy, timer.clone()));
                    Arc::new(WriteThroughCache::new(lru, file))
                }
                None => lru,
            }
        });
        let metadata_cache = self.metadata_cache.unwrap_or_else(|| cache.clone());
        let http_cache = HttpCache::new(cache, timer.clone(), options.failure_cache_ttl_ms);

        let lock_manager = self.lock_manager.unwrap_or_else(|| {
            if options.use_shared_mem_locking {
                MemLockManager::shared()
            } else {
                Arc::new(MemLockManager::new(timer.clone()))
            }
        });

        let mut filters = HashMap::new();
        for filter in self.filters {
            let id = filter.id();
            if filters.insert(id, filter).is_some() {
                return Err(Error::explain(
                    ErrorType::InternalError,
                    format!("filter id {id} registered twice"),
                ));
            }
        }
        for id in &options.enabled_filters {
            if !filters.contains_key(id.as_str()) {
                return Err(Error::explain(
                    ErrorType::InternalError,
                    format!("unknown filter {id} enabled"),
                ));
            }
        }

        let fetcher = Arc::new(RateControllingFetcher::new(
            self.fetcher,
            options.max_fetches_per_host,
            options.fetch_queue_size,
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Engine {
            inner: Arc::new(EngineInner {
                hasher: self
                    .hasher
                    .unwrap_or_else(|| Arc::new(Sha256Hasher::new(options.hash_length))),
                file_load: FileLoadPolicy::new(options.file_load.clone()),
                rewrite_pool: WorkerPool::new("rewrite", options.rewrite_worker_threads, None),
                low_priority_pool: WorkerPool::new(
                    "low-priority rewrite",
                    options.low_priority_worker_threads,
                    Some(options.max_low_priority_queue_depth),
                ),
                options: Arc::new(options),
                timer,
                metadata_cache,
                http_cache,
                fetcher,
                lock_manager,
                filters,
                stats: Statistics::default(),
                shutdown,
                background: Mutex::new(JoinSet::new()),
            }),
        })
    }
}

impl Engine {
    /// Starts building an engine
    pub fn builder(options: RewriteOptions) -> EngineBuilder {
        EngineBuilder::new(options)
    }

    /// Engine settings
    pub fn options(&self) -> &RewriteOptions {
        &self.inner.options
    }

    /// Engine counters
    pub fn statistics(&self) -> &Statistics {
        &self.inner.stats
    }

    /// The HTTP cache holding inputs and rewritten outputs
    pub fn http_cache(&self) -> &HttpCache {
        &self.inner.http_cache
    }

    /// The metadata cache holding rewrite decisions
    pub fn metadata_cache(&self) -> &Arc<dyn CacheInterface> {
        &self.inner.metadata_cache
    }

    /// Looks up a registered filter by id
    pub fn filter(&self, id: &str) -> Option<&Arc<dyn RewriteFilter>> {
        self.inner.filters.get(id)
    }

    /// Creates a driver rewriting an HTML document located at `base_url`, requested with the
    /// given request headers.
    pub fn new_driver(
        &self,
        base_url: &str,
        request_headers: &HeaderMap,
    ) -> Result<RewriteDriver, Box<Error>> {
        let base_url = Url::parse(base_url).map_err(|err| {
            Error::because(ErrorType::InternalError, "invalid document URL", err)
        })?;
        Ok(RewriteDriver::new(self.clone(), base_url, request_headers))
    }

    /// Signals all work to stop: fetches in progress fail, queued rewrites are discarded and
    /// detached rewrites stop without writing to the caches.
    pub fn shutdown(&self) {
        info!("shutting down rewrite engine");
        self.inner.shutdown.send_replace(true);
        self.inner.rewrite_pool.close();
        self.inner.low_priority_pool.close();
    }

    /// Whether [`Engine::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub(crate) fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while let Some(result) = background.try_join_next() {
            if let Err(err) = result {
                warn!("background rewrite failed: {err}");
            }
        }
        background.spawn(task);
    }

    /// Waits until all rewrites that continue in the background are complete
    pub async fn wait_for_background(&self) {
        loop {
            let mut tasks = std::mem::take(
                &mut *self
                    .inner
                    .background
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if tasks.is_empty() {
                break;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(err) = result {
                    warn!("background rewrite failed: {err}");
                }
            }
        }
    }

    /// Computes the URL of an output produced by `filter` from the given inputs. `None` if the
    /// name doesn't fit into a URL segment.
    pub(crate) fn output_url(
        &self,
        filter: &dyn RewriteFilter,
        inputs: &[&str],
        context: &ResourceContext,
        hash: &str,
        content_type: &ContentType,
    ) -> Option<String> {
        let first = Url::parse(inputs.first()?).ok()?;
        let base = directory_of(&first);
        let relative: Vec<String> = inputs.iter().map(|url| relative_url(&base, url)).collect();
        let name = filter.encoder().encode(&relative, context);
        if name.len() > self.inner.options.max_url_segment_size {
            debug!("output name for {} is too long", inputs[0]);
            return None;
        }
        let ext = content_type
            .extension()
            .map(str::to_owned)
            .or_else(|| {
                first
                    .path()
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_owned())
                    .filter(|ext| !ext.contains('/'))
            })
            .unwrap_or_else(|| "bin".to_owned());
        let namer = ResourceNamer {
            name,
            id: filter.id().to_owned(),
            hash: hash.to_owned(),
            ext,
        };
        base.join(&namer.encode()).ok().map(String::from)
    }

    fn loaded_resource(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
        policy: CachePolicy,
    ) -> Resource {
        let freshness = Freshness {
            date_ms: policy.date_ms,
            expiration_ms: policy.expiration_ms,
            last_modified_ms: policy.last_modified_ms,
            content_hash: Some(self.inner.hasher.hash(&body)),
            cacheable: policy.cacheable,
        };
        Resource::loaded(url, headers, body, freshness)
    }

    async fn load_file(&self, url: &str, path: std::path::PathBuf) -> Resource {
        let (contents, mtime) = match tokio::fs::read(&path).await {
            Ok(contents) => (contents, file_mtime_ms(&path).await),
            Err(err) => {
                debug!("failed reading {} for {url}: {err}", path.display());
                return Resource::failed(url, LoadFailure::FetchFailed);
            }
        };
        let now = self.inner.timer.now_ms();
        let mut headers = HeaderMap::new();
        if let Some(content_type) = ContentType::from_path(&path.to_string_lossy()) {
            if let Ok(value) = HeaderValue::from_str(content_type.mime()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
        let policy = CachePolicy {
            cacheable: true,
            date_ms: now,
            expiration_ms: now,
            last_modified_ms: mtime,
        };
        let mut resource = self.loaded_resource(url, headers, contents.into(), policy);
        resource.set_file_path(path);
        resource
    }

    async fn load_reconstructed(&self, url: &str) -> Option<Resource> {
        let parsed = Url::parse(url).ok()?;
        let (_, namer) = split_rewritten_url(&parsed)?;
        self.filter(&namer.id)?;
        trace!("reconstructing input {url}");
        match Box::pin(self.fetch_resource(url, &HeaderMap::new())).await {
            Ok(served) if served.status == StatusCode::OK => {
                let now = self.inner.timer.now_ms();
                let policy = cache_policy(
                    served.status,
                    &served.headers,
                    now,
                    self.inner.options.implicit_cache_ttl_ms,
                );
                Some(self.loaded_resource(url, served.headers, served.body, policy))
            }
            Ok(served) => {
                debug!("reconstructing {url} produced status {}", served.status);
                Some(Resource::failed(url, LoadFailure::FetchFailed))
            }
            Err(err) => {
                debug!("reconstructing {url} failed: {err}");
                Some(Resource::failed(url, LoadFailure::FetchFailed))
            }
        }
    }

    async fn load_from_origin(&self, url: &str) -> Resource {
        let inner = &self.inner;
        let timeout = Duration::from_millis(inner.options.fetcher_timeout_ms);
        let mut shutdown = self.shutdown_signal();
        let request_headers = HeaderMap::new();
        let fetch = tokio::time::timeout(timeout, inner.fetcher.fetch(url, &request_headers));
        let result = tokio::select! {
            result = fetch => result,
            _ = shutdown.wait_for(|shutdown| *shutdown) => {
                return Resource::failed(url, LoadFailure::Shutdown);
            }
        };

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(err)) if err.etype() == &TOO_BUSY => {
                debug!("not fetching {url}: {err}");
                return Resource::failed(url, LoadFailure::TooBusy);
            }
            Ok(Err(err)) => {
                warn!("fetching {url} failed: {err}");
                inner.http_cache.remember_fetch_failed(url).await;
                return Resource::failed(url, LoadFailure::FetchFailed);
            }
            Err(_) => {
                warn!("fetching {url} timed out");
                return Resource::failed(url, LoadFailure::FetchFailed);
            }
        };

        if response.status != StatusCode::OK {
            debug!("fetching {url} produced status {}", response.status);
            inner.http_cache.remember_fetch_failed(url).await;
            return Resource::failed(url, LoadFailure::FetchFailed);
        }
        if u64::try_from(response.body.len()).unwrap_or(u64::MAX) > inner.options.max_input_bytes {
            debug!("{url} exceeds the input size limit");
            return Resource::failed(url, LoadFailure::TooLarge);
        }

        let now = inner.timer.now_ms();
        let policy = cache_policy(
            response.status,
            &response.headers,
            now,
            inner.options.implicit_cache_ttl_ms,
        );
        if policy.cacheable {
            let value = HttpValue {
                status: response.status,
                headers: response.headers.clone(),
                body: response.body.clone(),
                date_ms: policy.date_ms,
                expiration_ms: policy.expiration_ms,
            };
            inner.http_cache.put(url, &value).await;
        } else {
            inner.http_cache.remember_uncacheable(url).await;
            if !inner.options.rewrite_uncacheable {
                debug!("{url} is not cacheable");
                return Resource::failed(url, LoadFailure::Uncacheable);
            }
        }
        self.loaded_resource(url, response.headers, response.body, policy)
    }

    /// Loads an input: from the filesystem if a file mapping applies, from the HTTP cache,
    /// by reconstructing it if it is a rewritten resource or from its origin. Responses from
    /// the origin are recorded in the HTTP cache.
    pub(crate) fn load_input(&self, url: String, mode: LoadMode) -> LoadFuture {
        let engine = self.clone();
        Box::pin(async move {
            if engine.is_shutting_down() {
                return Resource::failed(url, LoadFailure::Shutdown);
            }
            if let Some(path) = engine.inner.file_load.file_for(&url) {
                return engine.load_file(&url, path).await;
            }

            if mode == LoadMode::Cached {
                match engine.inner.http_cache.find(&url).await {
                    HttpCacheLookup::Found(value) => {
                        trace!("{url} found in HTTP cache");
                        let policy = CachePolicy {
                            cacheable: true,
                            date_ms: value.date_ms,
                            expiration_ms: value.expiration_ms,
                            last_modified_ms: parse_date_header(
                                &value.headers,
                                header::LAST_MODIFIED,
                            ),
                        };
                        return engine.loaded_resource(&url, value.headers, value.body, policy);
                    }
                    HttpCacheLookup::RecentFetchFailure => {
                        return Resource::failed(url, LoadFailure::RecentlyFailed);
                    }
                    HttpCacheLookup::RecentlyUncacheable
                        if !engine.inner.options.rewrite_uncacheable =>
                    {
                        return Resource::failed(url, LoadFailure::Uncacheable);
                    }
                    _ => {}
                }
            }

            if is_rewritten_url(&url) {
                if let Some(resource) = engine.load_reconstructed(&url).await {
                    return resource;
                }
            }
            engine.load_from_origin(&url).await
        })
    }
}
