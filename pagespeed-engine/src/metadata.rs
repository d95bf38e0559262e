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

//! The metadata cache protocol: partition keys, validation of cached records, revalidation of
//! expired inputs and background freshening of inputs close to expiry.

use log::{debug, trace, warn};
use std::collections::HashMap;
use std::path::Path;

use crate::engine::{Engine, LoadMode};
use crate::fetch::file_mtime_ms;
use crate::filter::RewriteFilter;
use crate::hasher::Hasher;
use crate::partitions::{InputInfo, InputKind, InputValidity, OutputPartitions};
use crate::resource::Resource;
use crate::stats::Counter;
use crate::user_agent::ResourceContext;

/// Outcome of reading a metadata record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// All inputs are valid
    Hit(OutputPartitions),
    /// Some inputs expired but can be confirmed by refetching them
    Revalidate(OutputPartitions),
    /// No usable record
    Miss,
}

/// Outcome of refetching inputs of a record
#[derive(Debug)]
pub(crate) enum Refresh {
    /// The refetched inputs are unchanged, the record has updated timestamps
    Current(Box<OutputPartitions>, Vec<Resource>),
    /// At least one input changed or could not be fetched
    Stale(Vec<Resource>),
}

/// Computes the key of the rewrite decision for a filter applied to the given inputs.
pub(crate) fn partition_key(
    hasher: &dyn Hasher,
    filter: &dyn RewriteFilter,
    urls: &[String],
    context: &ResourceContext,
) -> String {
    let context_key = context.cache_key();
    let suffix = filter.cache_key_suffix(context);
    let mut fragments = Vec::with_capacity(urls.len() + 3);
    fragments.push(filter.id());
    fragments.extend(urls.iter().map(String::as_str));
    fragments.push(&context_key);
    fragments.push(&suffix);
    hasher.cache_key(&format!("rname/{}", filter.id()), &fragments)
}

async fn file_unchanged(info: &InputInfo) -> bool {
    let Some(filename) = &info.filename else {
        return false;
    };
    match file_mtime_ms(Path::new(filename)).await {
        Some(mtime) => Some(mtime) == info.last_modified_ms,
        None => false,
    }
}

/// Reads and validates the record stored under `key` for a context with `num_inputs` inputs.
pub(crate) async fn lookup(engine: &Engine, key: &str, num_inputs: usize) -> Lookup {
    let inner = &engine.inner;
    let Some(data) = inner.metadata_cache.get(key).await else {
        trace!("no metadata for {key}");
        inner.stats.add(Counter::MetadataMisses);
        return Lookup::Miss;
    };

    let record = match OutputPartitions::decode(&data, num_inputs) {
        Ok(record) => record,
        Err(err) => {
            warn!("deleting corrupt metadata {key}: {err}");
            inner.metadata_cache.delete(key).await;
            inner.stats.add(Counter::MetadataMisses);
            return Lookup::Miss;
        }
    };

    let now = inner.timer.now_ms();
    let mut expired = false;
    for info in record.all_inputs() {
        let valid = match info.kind {
            InputKind::File => file_unchanged(info).await,
            _ => match info.check(now) {
                InputValidity::Valid => true,
                InputValidity::Expired
                    if info.content_hash.is_some() || info.last_modified_ms.is_some() =>
                {
                    expired = true;
                    true
                }
                InputValidity::Expired | InputValidity::Invalid => false,
            },
        };
        if !valid {
            debug!("metadata {key} invalidated by input {}", info.index);
            inner.stats.add(Counter::MetadataMisses);
            return Lookup::Miss;
        }
    }

    if expired {
        trace!("metadata {key} needs revalidation");
        Lookup::Revalidate(record)
    } else {
        inner.stats.add(Counter::MetadataHits);
        Lookup::Hit(record)
    }
}

fn still_matches(info: &InputInfo, resource: &Resource) -> bool {
    if !resource.is_loaded() || !resource.freshness().cacheable {
        return false;
    }
    let freshness = resource.freshness();
    match &info.content_hash {
        Some(hash) => freshness.content_hash.as_ref() == Some(hash),
        None => match (info.last_modified_ms, freshness.last_modified_ms) {
            (Some(recorded), Some(current)) => current <= recorded,
            _ => false,
        },
    }
}

fn input_url(info: &InputInfo, urls: &[String]) -> Option<String> {
    info.url.clone().or_else(|| urls.get(info.index).cloned())
}

/// Refetches all cache-based inputs expiring before `threshold_ms` and checks them against the
/// record. Inputs are fetched bypassing the HTTP cache.
pub(crate) async fn refresh(
    engine: &Engine,
    mut record: OutputPartitions,
    urls: &[String],
    threshold_ms: i64,
) -> Refresh {
    let mut loaded: HashMap<String, Resource> = HashMap::new();
    let mut stale = false;
    for info in record.all_inputs_mut() {
        if info.kind != InputKind::Cache || info.expiration_ms > threshold_ms {
            continue;
        }
        let Some(url) = input_url(info, urls) else {
            stale = true;
            continue;
        };
        if !loaded.contains_key(&url) {
            let resource = engine.load_input(url.clone(), LoadMode::Fresh).await;
            loaded.insert(url.clone(), resource);
        }
        let Some(resource) = loaded.get(&url) else {
            continue;
        };
        if still_matches(info, resource) {
            info.date_ms = resource.freshness().date_ms;
            info.expiration_ms = resource.freshness().expiration_ms;
        } else {
            debug!("input {url} changed");
            stale = true;
        }
    }

    let resources = loaded.into_values().collect();
    if stale {
        Refresh::Stale(resources)
    } else {
        Refresh::Current(Box::new(record), resources)
    }
}

/// Finds an input of the record that is no longer valid at `now_ms`
async fn outdated_input(record: &OutputPartitions, now_ms: i64) -> Option<&InputInfo> {
    for info in record.all_inputs() {
        let valid = match info.kind {
            InputKind::File => file_unchanged(info).await,
            _ => info.check(now_ms) == InputValidity::Valid,
        };
        if !valid {
            return Some(info);
        }
    }
    None
}

/// Writes a record, incrementing its generation. Nothing is written if any of the inputs
/// expired or changed in the meantime. Returns whether the record was written.
pub(crate) async fn write(engine: &Engine, key: &str, record: &mut OutputPartitions) -> bool {
    let inner = &engine.inner;
    if let Some(info) = outdated_input(record, inner.timer.now_ms()).await {
        debug!(
            "not writing metadata {key}, input {} is no longer valid",
            info.index
        );
        return false;
    }
    record.generation = record.generation.wrapping_add(1);
    match record.encode() {
        Ok(data) => {
            trace!("writing metadata {key} generation {}", record.generation);
            inner.metadata_cache.put(key, data, None).await;
            true
        }
        Err(err) => {
            warn!("failed writing metadata {key}: {err}");
            false
        }
    }
}

/// Checks whether any cache-based input of the record is close to its expiration.
pub(crate) fn needs_freshening(record: &OutputPartitions, now_ms: i64, margin_ms: i64) -> bool {
    record.all_inputs().any(|info| {
        info.kind == InputKind::Cache
            && info.expiration_ms > now_ms
            && info.expiration_ms <= now_ms.saturating_add(margin_ms)
    })
}

/// Refreshes inputs close to expiry. If all of them are unchanged, the record's timestamps are
/// updated, unless another writer replaced the record in the meantime.
pub(crate) async fn freshen(
    engine: Engine,
    key: String,
    record: OutputPartitions,
    urls: Vec<String>,
) {
    let inner = &engine.inner;
    let threshold = inner
        .timer
        .now_ms()
        .saturating_add(inner.options.freshen_margin_ms);
    let generation = record.generation;
    let num_inputs = urls.len();
    let Refresh::Current(mut refreshed, _) = refresh(&engine, record, &urls, threshold).await
    else {
        debug!("inputs of {key} changed, leaving freshening to the next rewrite");
        return;
    };

    let current = match inner.metadata_cache.get(&key).await {
        Some(data) => OutputPartitions::decode(&data, num_inputs).ok(),
        None => None,
    };
    if current.map(|current| current.generation) != Some(generation) {
        debug!("metadata {key} changed while freshening, discarding");
        return;
    }
    if engine.is_shutting_down() {
        return;
    }
    if write(&engine, &key, &mut refreshed).await {
        inner.stats.add(Counter::Freshens);
    }
}
