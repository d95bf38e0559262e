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

//! Per-context bookkeeping

use std::sync::Arc;

use crate::filter::{PartitionPlan, RewriteFilter, RewriteJob};
use crate::lock::LockToken;
use crate::partitions::OutputPartitions;
use crate::resource::ResourceId;
use crate::slot::SlotId;
use crate::user_agent::ResourceContext;

use super::ContextId;

/// Where a context is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Waiting for predecessors on its slots
    Initiated,
    /// Reading the metadata cache
    Lookup,
    /// Refetching expired inputs of a metadata record
    Revalidating,
    /// Acquiring the lock of the partition key
    Locking,
    /// Loading inputs
    Fetching,
    /// Filter deciding on partitions
    Partitioning,
    /// Partitions being rewritten
    Rewriting,
    /// Outputs and metadata being written
    WritingCaches,
    /// Waiting for another context with the same partition key
    Repeated,
    /// Complete, the result is available
    Done,
    /// Never ran
    Canceled,
}

/// A nested rewrite requested by one of the context's partitions
#[derive(Debug, Clone)]
pub(crate) struct NestedChild {
    /// URL as written in the input
    pub(crate) url: String,
    /// The child context, `None` if the URL couldn't be resolved
    pub(crate) context: Option<ContextId>,
}

/// A rewrite of a set of slots by one filter
#[derive(Debug)]
pub(crate) struct Context {
    pub(crate) filter: Arc<dyn RewriteFilter>,
    pub(crate) slots: Vec<SlotId>,
    pub(crate) resource_context: ResourceContext,
    pub(crate) parent: Option<(ContextId, usize)>,
    pub(crate) phase: Phase,

    /// Number of predecessors that haven't completed yet
    pub(crate) waiting: usize,
    pub(crate) successors: Vec<ContextId>,
    pub(crate) repeated: Vec<ContextId>,

    pub(crate) key: Option<String>,
    pub(crate) urls: Vec<String>,
    pub(crate) lock: Option<LockToken>,
    pub(crate) lock_attempted: bool,

    pub(crate) partitions: OutputPartitions,
    pub(crate) plans: Vec<PartitionPlan>,
    pub(crate) jobs: Vec<Option<RewriteJob>>,
    pub(crate) outputs: Vec<Option<ResourceId>>,
    pub(crate) nested: Vec<Vec<NestedChild>>,
    pub(crate) nested_pending: Vec<usize>,
    pub(crate) pending_bodies: Vec<(String, crate::cache::HttpValue)>,
    /// Loads or rewrites still outstanding
    pub(crate) outstanding: usize,

    pub(crate) force_rewrite: bool,
    pub(crate) is_metadata_cache_miss: bool,
    pub(crate) revalidate_ok: bool,
    pub(crate) stale_rewrite: bool,
    pub(crate) was_too_busy: bool,
    pub(crate) rewrite_uncacheable: bool,
    pub(crate) slow: bool,
    pub(crate) rendered: bool,
}

impl Context {
    pub(crate) fn new(
        filter: Arc<dyn RewriteFilter>,
        slots: Vec<SlotId>,
        resource_context: ResourceContext,
        parent: Option<(ContextId, usize)>,
    ) -> Self {
        Self {
            filter,
            slots,
            resource_context,
            parent,
            phase: Phase::Initiated,
            waiting: 0,
            successors: Vec::new(),
            repeated: Vec::new(),
            key: None,
            urls: Vec::new(),
            lock: None,
            lock_attempted: false,
            partitions: OutputPartitions::new(),
            plans: Vec::new(),
            jobs: Vec::new(),
            outputs: Vec::new(),
            nested: Vec::new(),
            nested_pending: Vec::new(),
            pending_bodies: Vec::new(),
            outstanding: 0,
            force_rewrite: false,
            is_metadata_cache_miss: false,
            revalidate_ok: false,
            stale_rewrite: false,
            was_too_busy: false,
            rewrite_uncacheable: false,
            slow: false,
            rendered: false,
        }
    }

    /// Whether the context reached a final state
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Canceled)
    }

    /// Whether the result may be stored in the metadata cache
    pub(crate) fn may_write_metadata(&self) -> bool {
        (self.is_metadata_cache_miss || self.revalidate_ok)
            && !self.was_too_busy
            && !self.rewrite_uncacheable
            && self.key.is_some()
    }
}
