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

//! The rewrite context state machine: metadata lookup, revalidation, locking, input loading,
//! partitioning, rewriting, nested rewrites, cache writes and completion.

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use crate::cache::HttpValue;
use crate::filter::{
    NestedRequest, NestedResult, OutputContent, OutputKind, RewriteJob, RewriteResult,
    RewriteStep, SlotRender,
};
use crate::headers::{set_long_lived, ONE_YEAR_MS};
use crate::lock::lock_with_wait;
use crate::metadata::{self, Lookup, Refresh};
use crate::partitions::{CachedResult, InputInfo, InputKind, OutputPartitions};
use crate::resource::{Freshness, LoadFailure, LoadState, Resource, ResourceId};
use crate::slot::SlotKind;
use crate::stats::Counter;
use crate::workers::WorkerPool;

use super::context::NestedChild;
use super::{Context, ContextId, Continuation, DriverState, Mode, Phase};

/// Whether an input failed for reasons that say nothing about the input itself
fn transient_failure(input: &Resource) -> bool {
    matches!(
        input.state(),
        LoadState::Failed(LoadFailure::TooBusy | LoadFailure::Shutdown)
    )
}

/// Describes an input for the metadata record. Inputs that failed to load are recorded without
/// a hash, expiring after `failure_ttl_ms`.
fn input_record(input: &Resource, index: usize, now_ms: i64, failure_ttl_ms: i64) -> InputInfo {
    if input.is_loaded() {
        return input.input_info(index, true);
    }
    InputInfo {
        kind: InputKind::Cache,
        index,
        date_ms: now_ms,
        expiration_ms: now_ms.saturating_add(failure_ttl_ms),
        last_modified_ms: None,
        content_hash: None,
        filename: None,
        url: None,
    }
}

impl DriverState {
    fn ctx(&mut self, id: ContextId) -> &mut Context {
        &mut self.contexts[id.0]
    }

    fn pool(&self, id: ContextId) -> WorkerPool {
        let inner = &self.engine.inner;
        if self.detached || self.contexts[id.0].slow {
            inner.low_priority_pool.clone()
        } else {
            inner.rewrite_pool.clone()
        }
    }

    fn input_urls(&self, id: ContextId) -> Vec<String> {
        self.contexts[id.0]
            .slots
            .iter()
            .map(|slot| {
                self.resources
                    .get(self.slots[slot.0].resource())
                    .url()
                    .to_owned()
            })
            .collect()
    }

    fn inputs(&self, id: ContextId) -> Vec<Resource> {
        self.contexts[id.0]
            .slots
            .iter()
            .map(|slot| self.resources.get(self.slots[slot.0].resource()).clone())
            .collect()
    }

    pub(super) fn resume(&mut self, id: ContextId, continuation: Continuation) {
        trace!("context {id:?} resumes with {continuation:?}");
        match continuation {
            Continuation::Looked(lookup) => self.looked_up(id, lookup),
            Continuation::Revalidated(refresh) => self.revalidated(id, refresh),
            Continuation::Locked { token, contended } => self.locked(id, token, contended),
            Continuation::Partitioned(plans) => self.partitioned(id, plans),
            Continuation::Rewritten(partition, step) => match step {
                Some(RewriteStep::Done(result)) => self.rewrite_done(id, partition, result),
                Some(RewriteStep::Nested(requests)) => self.start_nested(id, partition, requests),
                None => self.rewrite_done(id, partition, RewriteResult::TooBusy),
            },
            Continuation::NestedDone(partition) => self.harvest(id, partition),
            Continuation::Harvested(partition, result) => self.rewrite_done(id, partition, result),
            Continuation::CachesWritten => self.done(id),
        }
    }

    /// Leaves the initiated state once all predecessors are done.
    pub(super) fn start(&mut self, id: ContextId) {
        let canceled = self.contexts[id.0]
            .slots
            .iter()
            .any(|slot| self.slots[slot.0].flags().disable_further_processing);
        if canceled {
            debug!("canceling context {id:?}, its slot is not to be processed further");
            self.ctx(id).phase = Phase::Canceled;
            self.retire(id);
            return;
        }

        let urls = self.input_urls(id);
        let ctx = &self.contexts[id.0];
        let key = metadata::partition_key(
            self.engine.inner.hasher.as_ref(),
            ctx.filter.as_ref(),
            &urls,
            &ctx.resource_context,
        );
        let force_rewrite = ctx.force_rewrite;
        trace!("context {id:?} has partition key {key}");

        if !force_rewrite {
            if let Some(&primary) = self.primary_by_key.get(&key) {
                match self.contexts[primary.0].phase {
                    Phase::Done => {
                        self.ctx(id).urls = urls;
                        self.adopt(id, primary);
                        return;
                    }
                    Phase::Canceled => {}
                    _ => {
                        trace!("context {id:?} repeats {primary:?}");
                        let ctx = self.ctx(id);
                        ctx.urls = urls;
                        ctx.phase = Phase::Repeated;
                        self.ctx(primary).repeated.push(id);
                        return;
                    }
                }
            }
            self.primary_by_key.insert(key.clone(), id);
        }

        let ctx = self.ctx(id);
        ctx.key = Some(key);
        ctx.urls = urls;
        if force_rewrite {
            ctx.is_metadata_cache_miss = true;
            self.miss(id);
        } else {
            self.lookup(id);
        }
    }

    fn lookup(&mut self, id: ContextId) {
        let ctx = self.ctx(id);
        ctx.phase = Phase::Lookup;
        let Some(key) = ctx.key.clone() else {
            return;
        };
        let num_inputs = ctx.slots.len();
        let engine = self.engine.clone();
        self.suspend(id, async move {
            Continuation::Looked(metadata::lookup(&engine, &key, num_inputs).await)
        });
    }

    fn looked_up(&mut self, id: ContextId, lookup: Lookup) {
        match lookup {
            Lookup::Hit(record) => {
                let inner = &self.engine.inner;
                let now = inner.timer.now_ms();
                if metadata::needs_freshening(&record, now, inner.options.freshen_margin_ms) {
                    let ctx = &self.contexts[id.0];
                    if let Some(key) = ctx.key.clone() {
                        debug!("freshening inputs of {key}");
                        let freshen = metadata::freshen(
                            self.engine.clone(),
                            key,
                            record.clone(),
                            ctx.urls.clone(),
                        );
                        self.engine.spawn_background(freshen);
                    }
                }
                self.cached_result(id, record);
            }
            Lookup::Revalidate(record) => {
                let ctx = self.ctx(id);
                ctx.phase = Phase::Revalidating;
                let urls = ctx.urls.clone();
                let engine = self.engine.clone();
                self.suspend(id, async move {
                    let now = engine.inner.timer.now_ms();
                    Continuation::Revalidated(metadata::refresh(&engine, record, &urls, now).await)
                });
            }
            Lookup::Miss => {
                self.ctx(id).is_metadata_cache_miss = true;
                self.miss(id);
            }
        }
    }

    fn revalidated(&mut self, id: ContextId, refresh: Refresh) {
        match refresh {
            Refresh::Current(record, resources) => {
                debug!("context {id:?} revalidated its inputs");
                for resource in resources {
                    self.store_resource(resource);
                }
                self.engine.inner.stats.add(Counter::MetadataRevalidations);
                self.ctx(id).revalidate_ok = true;
                self.cached_result(id, *record);
            }
            Refresh::Stale(resources) => {
                debug!("context {id:?} inputs changed, rewriting");
                for resource in resources {
                    self.store_resource(resource);
                }
                let ctx = self.ctx(id);
                ctx.stale_rewrite = true;
                ctx.is_metadata_cache_miss = true;
                self.miss(id);
            }
        }
    }

    /// Takes over a metadata record: outputs are referenced by URL, their contents are loaded
    /// on demand.
    fn cached_result(&mut self, id: ContextId, record: OutputPartitions) {
        let outputs = record
            .partitions
            .iter()
            .map(|partition| match (&partition.url, partition.optimizable) {
                (Some(url), true) => Some(self.resources.get_or_create(url)),
                _ => None,
            })
            .collect();
        let ctx = self.ctx(id);
        ctx.partitions = record;
        ctx.outputs = outputs;
        // Only a revalidated record is written back
        self.write_caches(id);
    }

    fn miss(&mut self, id: ContextId) {
        let ctx = self.ctx(id);
        if ctx.lock.is_some() || ctx.lock_attempted {
            self.fetch_inputs(id);
            return;
        }
        ctx.phase = Phase::Locking;
        ctx.lock_attempted = true;
        let Some(key) = ctx.key.clone() else {
            return;
        };

        let inner = &self.engine.inner;
        let manager = inner.lock_manager.clone();
        let ttl = Duration::from_millis(inner.options.rewrite_lock_ttl_ms);
        let wait = Duration::from_millis(inner.options.lock_wait_ms);
        self.suspend(id, async move {
            if let Some(token) = manager.try_lock(&key, ttl) {
                return Continuation::Locked {
                    token: Some(token),
                    contended: false,
                };
            }
            trace!("waiting for lock {key}");
            Continuation::Locked {
                token: lock_with_wait(manager.as_ref(), &key, ttl, wait).await,
                contended: true,
            }
        });
    }

    fn locked(&mut self, id: ContextId, token: Option<crate::lock::LockToken>, contended: bool) {
        let mode = self.mode;
        let ctx = self.ctx(id);
        match token {
            Some(token) => {
                ctx.lock = Some(token);
                if contended && !ctx.force_rewrite {
                    // Whoever held the lock might have produced a result by now
                    self.lookup(id);
                } else {
                    self.fetch_inputs(id);
                }
            }
            None if mode == Mode::Html => {
                debug!("another rewrite holds the lock of context {id:?}, giving up");
                ctx.was_too_busy = true;
                self.complete(id);
            }
            None => {
                debug!("context {id:?} proceeds without the lock");
                self.fetch_inputs(id);
            }
        }
    }

    fn fetch_inputs(&mut self, id: ContextId) {
        self.ctx(id).phase = Phase::Fetching;
        let resources: HashSet<ResourceId> = self.contexts[id.0]
            .slots
            .iter()
            .map(|slot| self.slots[slot.0].resource())
            .collect();

        let mut outstanding = 0;
        for resource in resources {
            match self.resources.get(resource).state() {
                LoadState::NotLoaded => {
                    self.resources
                        .get_mut(resource)
                        .set_state(LoadState::Loading);
                    self.wait_for_load(resource, id);
                    self.load(resource);
                    outstanding += 1;
                }
                LoadState::Loading => {
                    self.wait_for_load(resource, id);
                    outstanding += 1;
                }
                LoadState::Loaded | LoadState::Failed(_) => {}
            }
        }

        self.ctx(id).outstanding = outstanding;
        if outstanding == 0 {
            self.inputs_ready(id);
        }
    }

    /// Records an unoptimizable result for inputs that couldn't be loaded. Input records of
    /// failed inputs expire after the failure TTL so that the rewrite is retried eventually.
    fn input_unavailable(&mut self, id: ContextId, inputs: &[Resource]) {
        let inner = &self.engine.inner;
        let now = inner.timer.now_ms();
        let failure_ttl = inner.options.failure_cache_ttl_ms;
        let transient = inputs.iter().any(transient_failure);

        let input_info = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| input_record(input, index, now, failure_ttl))
            .collect();

        let ctx = self.ctx(id);
        debug!("inputs of context {id:?} are unavailable");
        ctx.partitions = OutputPartitions::new();
        ctx.partitions.partitions.push(CachedResult {
            inputs: (0..inputs.len()).collect(),
            input_info,
            ..Default::default()
        });
        ctx.outputs = vec![None];
        ctx.was_too_busy |= transient;
        self.write_caches(id);
    }

    pub(super) fn inputs_ready(&mut self, id: ContextId) {
        if self.engine.is_shutting_down() {
            self.abandon(id);
            return;
        }

        let inputs = self.inputs(id);
        let ctx = &self.contexts[id.0];
        if ctx.filter.requires_all_inputs() && !inputs.iter().all(Resource::is_loaded) {
            self.input_unavailable(id, &inputs);
            return;
        }
        let uncacheable = inputs
            .iter()
            .any(|input| input.is_loaded() && !input.freshness().cacheable);
        if uncacheable {
            trace!("context {id:?} has uncacheable inputs, not recording the result");
        }

        let transient = inputs.iter().any(transient_failure);

        let pool = self.pool(id);
        let ctx = self.ctx(id);
        ctx.rewrite_uncacheable = uncacheable;
        ctx.was_too_busy |= transient;
        ctx.phase = Phase::Partitioning;
        let filter = ctx.filter.clone();
        let options = self.engine.inner.options.clone();
        let pending = filter.partition_async(&inputs, &options);
        self.suspend(id, async move {
            let plans = match pending {
                Some(pending) => pending.await,
                None => pool
                    .run(move || filter.partition(&inputs, &options))
                    .await
                    .unwrap_or_else(|err| {
                        debug!("partitioning not possible: {err}");
                        None
                    }),
            };
            Continuation::Partitioned(plans)
        });
    }

    fn partitioned(&mut self, id: ContextId, plans: Option<Vec<crate::filter::PartitionPlan>>) {
        let Some(mut plans) = plans else {
            debug!("context {id:?} too busy to partition");
            self.engine.inner.stats.add(Counter::TooBusy);
            self.ctx(id).was_too_busy = true;
            self.complete(id);
            return;
        };

        let inputs = self.inputs(id);
        plans.retain(|plan| {
            let valid = !plan.inputs.is_empty()
                && plan
                    .inputs
                    .iter()
                    .all(|index| inputs.get(*index).is_some_and(Resource::is_loaded));
            if !valid {
                warn!("dropping invalid partition {:?}", plan.inputs);
            }
            valid
        });

        let ctx = &self.contexts[id.0];
        let options = self.engine.inner.options.clone();
        let jobs: Vec<_> = plans
            .iter()
            .enumerate()
            .map(|(partition, plan)| RewriteJob {
                partition,
                inputs: plan
                    .inputs
                    .iter()
                    .map(|index| inputs[*index].clone())
                    .collect(),
                resource_context: ctx.resource_context.clone(),
                options: options.clone(),
            })
            .collect();

        let mut partitions = OutputPartitions::new();
        partitions.partitions = plans
            .iter()
            .map(|plan| CachedResult {
                inputs: plan.inputs.clone(),
                input_info: plan
                    .inputs
                    .iter()
                    .map(|index| inputs[*index].input_info(*index, plan.include_hash))
                    .collect(),
                ..Default::default()
            })
            .collect();

        // Inputs left out of all partitions still decide whether the result stays valid
        let now = self.engine.inner.timer.now_ms();
        let failure_ttl = self.engine.inner.options.failure_cache_ttl_ms;
        partitions.other_dependencies = inputs
            .iter()
            .enumerate()
            .filter(|(index, _)| !plans.iter().any(|plan| plan.inputs.contains(index)))
            .map(|(index, input)| input_record(input, index, now, failure_ttl))
            .collect();

        let count = plans.len();
        trace!("context {id:?} has {count} partitions");
        let ctx = self.ctx(id);
        ctx.partitions = partitions;
        ctx.plans = plans;
        ctx.outputs = vec![None; count];
        ctx.nested = vec![Vec::new(); count];
        ctx.nested_pending = vec![0; count];
        ctx.jobs = jobs.iter().cloned().map(Some).collect();
        ctx.outstanding = count;
        ctx.phase = Phase::Rewriting;
        if count == 0 {
            self.write_caches(id);
            return;
        }

        for job in jobs {
            self.engine.inner.stats.add(Counter::RewritesExecuted);
            let pool = self.pool(id);
            let filter = self.contexts[id.0].filter.clone();
            let partition = job.partition;
            self.suspend(id, async move {
                let step = pool.run(move || filter.rewrite(&job)).await;
                Continuation::Rewritten(partition, step.ok())
            });
        }
    }

    fn start_nested(&mut self, id: ContextId, partition: usize, requests: Vec<NestedRequest>) {
        let Some(base) = self.contexts[id.0].jobs[partition]
            .as_ref()
            .and_then(|job| job.inputs.first())
            .and_then(|input| Url::parse(input.url()).ok())
        else {
            self.rewrite_done(id, partition, RewriteResult::Failed);
            return;
        };

        let targets: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let resolved = base
                    .join(&request.url)
                    .ok()
                    .filter(|url| matches!(url.scheme(), "http" | "https"));
                (request, resolved)
            })
            .collect();
        let pending = targets.iter().filter(|(_, url)| url.is_some()).count();
        trace!("context {id:?} partition {partition} starts {pending} nested rewrites");
        let (resource_context, slow) = {
            let ctx = self.ctx(id);
            ctx.nested_pending[partition] = pending;
            (ctx.resource_context.clone(), ctx.slow)
        };

        for (request, resolved) in targets {
            let NestedRequest { filter, url } = request;
            let index = self.contexts[id.0].nested[partition].len();
            self.ctx(id).nested[partition].push(NestedChild { url, context: None });
            let Some(resolved) = resolved else {
                continue;
            };
            let resource = self.resources.get_or_create(resolved.as_str());
            let slot = self.add_slot(SlotKind::Css, resource);
            let child = self.initiate(
                filter,
                vec![slot],
                resource_context.clone(),
                Some((id, partition)),
            );
            self.ctx(child).slow |= slow;
            self.ctx(id).nested[partition][index].context = Some(child);
        }

        if pending == 0 {
            self.defer(id, Continuation::NestedDone(partition));
        }
    }

    fn harvest(&mut self, id: ContextId, partition: usize) {
        let ctx = &self.contexts[id.0];
        let Some(job) = ctx.jobs[partition].clone() else {
            return;
        };

        let mut results = Vec::new();
        let mut dependencies = Vec::new();
        let mut child_too_busy = false;
        for nested in &ctx.nested[partition] {
            let rendered_url = nested.context.and_then(|child| {
                let child = &self.contexts[child.0];
                child_too_busy |= child.was_too_busy;
                for info in child.partitions.all_inputs() {
                    let mut info = info.clone();
                    if info.url.is_none() {
                        info.url = child.urls.get(info.index).cloned();
                    }
                    dependencies.push(info);
                }
                let slot = &self.slots[child.slots.first()?.0];
                slot.rendered_url().map(str::to_owned)
            });
            results.push(NestedResult {
                url: nested.url.clone(),
                rendered_url,
            });
        }

        let pool = self.pool(id);
        let filter = ctx.filter.clone();
        let ctx = self.ctx(id);
        if child_too_busy {
            debug!("nested rewrite of context {id:?} was too busy, not recording the result");
            ctx.was_too_busy = true;
        }
        ctx.partitions.partitions[partition].other_dependencies = dependencies;
        self.suspend(id, async move {
            let result = pool
                .run(move || filter.harvest(&job, &results))
                .await
                .unwrap_or(RewriteResult::TooBusy);
            Continuation::Harvested(partition, result)
        });
    }

    fn rewrite_done(&mut self, id: ContextId, partition: usize, result: RewriteResult) {
        trace!("context {id:?} partition {partition} rewritten: {result:?}");
        match result {
            RewriteResult::Ok(output) => self.output_produced(id, partition, output),
            RewriteResult::Failed => {}
            RewriteResult::TooBusy => {
                self.engine.inner.stats.add(Counter::TooBusy);
                self.ctx(id).was_too_busy = true;
            }
        }

        let ctx = self.ctx(id);
        ctx.outstanding = ctx.outstanding.saturating_sub(1);
        if ctx.outstanding == 0 {
            self.write_caches(id);
        }
    }

    fn output_produced(&mut self, id: ContextId, partition: usize, output: OutputContent) {
        let ctx = &self.contexts[id.0];
        let Some(job) = &ctx.jobs[partition] else {
            return;
        };
        let inputs: Vec<&str> = job.inputs.iter().map(Resource::url).collect();
        let hash = self.engine.inner.hasher.hash(&output.contents);
        let Some(url) = self.engine.output_url(
            ctx.filter.as_ref(),
            &inputs,
            &ctx.resource_context,
            &hash,
            &output.content_type,
        ) else {
            return;
        };
        let output_kind = ctx.filter.output_kind();

        let now = self.engine.inner.timer.now_ms();
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(output.content_type.mime()) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        set_long_lived(&mut headers, now);
        let freshness = Freshness {
            date_ms: now,
            expiration_ms: now.saturating_add(ONE_YEAR_MS),
            last_modified_ms: None,
            content_hash: Some(hash.clone()),
            cacheable: true,
        };
        let body: Bytes = output.contents;
        let resource = Resource::loaded(url.clone(), headers.clone(), body.clone(), freshness);
        let resource = self.store_resource(resource);

        let ctx = self.ctx(id);
        let result = &mut ctx.partitions.partitions[partition];
        result.optimizable = true;
        result.url = Some(url.clone());
        result.hash = Some(hash);
        ctx.outputs[partition] = Some(resource);
        if output_kind != OutputKind::OnTheFly {
            ctx.pending_bodies.push((
                url,
                HttpValue {
                    status: StatusCode::OK,
                    headers,
                    body,
                    date_ms: now,
                    expiration_ms: now.saturating_add(ONE_YEAR_MS),
                },
            ));
        }
    }

    /// Stores output bodies, then the metadata record if the result may be reused.
    fn write_caches(&mut self, id: ContextId) {
        self.complete_slots(id);
        let shutting_down = self.engine.is_shutting_down();
        let ctx = self.ctx(id);
        let bodies = std::mem::take(&mut ctx.pending_bodies);
        let record = (ctx.may_write_metadata() && !shutting_down)
            .then(|| ctx.key.clone().map(|key| (key, ctx.partitions.clone())))
            .flatten();
        if shutting_down || (bodies.is_empty() && record.is_none()) {
            self.done(id);
            return;
        }

        ctx.phase = Phase::WritingCaches;
        let engine = self.engine.clone();
        self.suspend(id, async move {
            for (url, value) in bodies {
                engine.inner.http_cache.put(&url, &value).await;
            }
            if let Some((key, mut record)) = record {
                if engine.is_shutting_down() {
                    debug!("not writing metadata {key} on shutdown");
                } else {
                    metadata::write(&engine, &key, &mut record).await;
                }
            }
            Continuation::CachesWritten
        });
    }

    /// Completes a context that reused a result without writing anything.
    fn complete(&mut self, id: ContextId) {
        self.complete_slots(id);
        self.done(id);
    }

    /// Applies the result to the slots: optimized slots refer to the output from now on,
    /// slots whose content became part of another slot's output are marked for deletion.
    /// The document only changes once the context is rendered.
    fn complete_slots(&mut self, id: ContextId) {
        let ctx = &self.contexts[id.0];
        let mut changes = Vec::new();
        for (position, slot) in ctx.slots.iter().enumerate() {
            let Some(partition) = ctx.partitions.partition_for_input(position) else {
                continue;
            };
            let result = &ctx.partitions.partitions[partition];
            let output = ctx.outputs.get(partition).copied().flatten();
            let optimizable = result.optimizable && output.is_some();
            let index = result
                .inputs
                .iter()
                .position(|input| *input == position)
                .unwrap_or_default();
            changes.push((*slot, ctx.filter.render_slot(index, optimizable), output));
        }

        for (slot, render, output) in changes {
            let slot = &mut self.slots[slot.0];
            match (render, output) {
                (SlotRender::Url, Some(output)) => {
                    slot.set_resource(output);
                    slot.flags.was_optimized = true;
                }
                (SlotRender::Delete, _) => {
                    slot.flags.delete_element = true;
                    slot.flags.disable_further_processing = true;
                }
                _ => {}
            }
        }
    }

    /// Takes over the result of the context that ran for the same partition key
    fn adopt(&mut self, id: ContextId, primary: ContextId) {
        trace!("context {id:?} takes over the result of {primary:?}");
        let (partitions, outputs, was_too_busy) = {
            let primary = &self.contexts[primary.0];
            (
                primary.partitions.clone(),
                primary.outputs.clone(),
                primary.was_too_busy,
            )
        };
        let ctx = self.ctx(id);
        ctx.partitions = partitions;
        ctx.outputs = outputs;
        ctx.was_too_busy = was_too_busy;
        self.complete(id);
    }

    /// Drops a context without a result
    fn abandon(&mut self, id: ContextId) {
        debug!("abandoning context {id:?}");
        let ctx = self.ctx(id);
        ctx.was_too_busy = true;
        ctx.pending_bodies.clear();
        self.done(id);
    }

    fn done(&mut self, id: ContextId) {
        let ctx = self.ctx(id);
        ctx.phase = Phase::Done;
        if let Some(token) = ctx.lock.take() {
            self.engine.inner.lock_manager.unlock(&token);
        }

        for repeated in std::mem::take(&mut self.ctx(id).repeated) {
            self.adopt(repeated, id);
        }

        if self.contexts[id.0].parent.is_some() {
            // Nested results are rendered into their stylesheet right away, there is no
            // deadline for these.
            let slots = self.contexts[id.0].slots.clone();
            for slot in slots {
                let slot = &mut self.slots[slot.0];
                if slot.flags().was_optimized {
                    let url = self.resources.get(slot.resource()).url().to_owned();
                    slot.render(&url, &mut self.document);
                }
            }
        }
        self.retire(id);
    }

    /// Notifies everyone waiting for a finished context
    fn retire(&mut self, id: ContextId) {
        let ctx = self.ctx(id);
        let successors = std::mem::take(&mut ctx.successors);
        let slow = ctx.slow;
        let parent = ctx.parent;
        let slots = ctx.slots.clone();
        trace!("context {id:?} finished as {:?}", ctx.phase);

        for slot in slots {
            self.slots[slot.0].detach(id);
        }

        if let Some((parent, partition)) = parent {
            let parent_ctx = self.ctx(parent);
            if let Some(pending) = parent_ctx.nested_pending.get_mut(partition) {
                *pending = pending.saturating_sub(1);
                if *pending == 0 && !parent_ctx.is_finished() {
                    self.defer(parent, Continuation::NestedDone(partition));
                }
            }
        }

        for successor in successors {
            let successor_ctx = self.ctx(successor);
            successor_ctx.waiting = successor_ctx.waiting.saturating_sub(1);
            successor_ctx.slow |= slow;
            if successor_ctx.waiting == 0 && successor_ctx.phase == Phase::Initiated {
                self.start(successor);
            }
        }
    }
}
