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

//! Drivers own everything related to a single request: the resources and slots referenced,
//! the rewrite contexts and, for HTML requests, the document being rewritten.
//!
//! Contexts never block. Each suspension point (cache reads and writes, fetches, lock
//! acquisition, filter work on a worker pool) is a spawned task which reports back with an
//! [`Event`] carrying a continuation tag. The driver processes events one by one, so context
//! state is only ever mutated by the driver's own task.

mod context;
mod fetch;
mod html;
mod machine;

use http::HeaderMap;
use log::{debug, trace};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use url::Url;

use crate::engine::Engine;
use crate::filter::{PartitionPlan, RewriteFilter, RewriteResult, RewriteStep};
use crate::html::{ElementId, HtmlDocument};
use crate::lock::LockToken;
use crate::metadata::{Lookup, Refresh};
use crate::resource::{Resource, ResourceArena, ResourceId};
use crate::slot::{Slot, SlotId, SlotKind};
use crate::user_agent::{ResourceContext, UserAgentInfo};

pub use html::{HtmlScope, RewriteDriver};

pub(crate) use context::{Context, Phase};
pub(crate) use fetch::FetchOutcome;

/// Index of a rewrite context within its driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) usize);

/// The request flow a driver serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Rewriting references in an HTML document
    Html,
    /// Producing an output for a reconstruction or in-place request
    Fetch,
}

/// Where a suspended context continues
#[derive(Debug)]
pub(crate) enum Continuation {
    Looked(Lookup),
    Revalidated(Refresh),
    Locked {
        token: Option<LockToken>,
        contended: bool,
    },
    Partitioned(Option<Vec<PartitionPlan>>),
    Rewritten(usize, Option<RewriteStep>),
    NestedDone(usize),
    Harvested(usize, RewriteResult),
    CachesWritten,
}

/// Completion of an awaited operation
#[derive(Debug)]
pub(crate) enum Event {
    Context(ContextId, Continuation),
    ResourceLoaded(ResourceId, Box<Resource>),
}

/// Everything a driver owns
#[derive(Debug)]
pub(crate) struct DriverState {
    pub(crate) engine: Engine,
    pub(crate) mode: Mode,
    pub(crate) base_url: Url,
    pub(crate) user_agent: UserAgentInfo,
    pub(crate) resources: ResourceArena,
    pub(crate) slots: Vec<Slot>,
    pub(crate) contexts: Vec<Context>,
    pub(crate) document: HtmlDocument,
    html_slots: HashMap<(ElementId, String), SlotId>,
    /// Top-level contexts in initiation order, awaiting rendering
    pub(crate) render_queue: Vec<ContextId>,
    primary_by_key: HashMap<String, ContextId>,
    /// Contexts waiting for a resource being loaded
    loading: HashMap<ResourceId, Vec<ContextId>>,
    /// Set once the driver's request has been answered
    pub(crate) detached: bool,
    sender: mpsc::UnboundedSender<Event>,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl DriverState {
    pub(crate) fn new(
        engine: Engine,
        mode: Mode,
        base_url: Url,
        request_headers: &HeaderMap,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            engine,
            mode,
            base_url,
            user_agent: UserAgentInfo::from_headers(request_headers),
            resources: ResourceArena::default(),
            slots: Vec::new(),
            contexts: Vec::new(),
            document: HtmlDocument::new(),
            html_slots: HashMap::new(),
            render_queue: Vec::new(),
            primary_by_key: HashMap::new(),
            loading: HashMap::new(),
            detached: false,
            sender,
            receiver,
        }
    }

    pub(crate) fn add_slot(&mut self, kind: SlotKind, resource: ResourceId) -> SlotId {
        let id = SlotId(self.slots.len());
        self.slots.push(Slot::new(kind, resource));
        id
    }

    /// Creates the slot for a URL in an element attribute, one per element and attribute.
    /// Only `http` and `https` URLs can be rewritten.
    pub(crate) fn html_slot(&mut self, element: ElementId, attribute: &str) -> Option<SlotId> {
        if let Some(slot) = self.html_slots.get(&(element, attribute.to_owned())) {
            return Some(*slot);
        }
        let value = self.document.element(element)?.attribute(attribute)?;
        let url = self.base_url.join(value.trim()).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            trace!("not rewriting {url}");
            return None;
        }
        let resource = self.resources.get_or_create(url.as_str());
        let slot = self.add_slot(
            SlotKind::Html {
                element,
                attribute: attribute.to_owned(),
            },
            resource,
        );
        self.html_slots.insert((element, attribute.to_owned()), slot);
        Some(slot)
    }

    /// Replaces the contents of a resource with a newer load result
    pub(crate) fn store_resource(&mut self, resource: Resource) -> ResourceId {
        match self.resources.find(resource.url()) {
            Some(id) => {
                if resource.is_loaded() || !self.resources.get(id).is_loaded() {
                    *self.resources.get_mut(id) = resource;
                }
                id
            }
            None => self.resources.insert(resource),
        }
    }

    /// Runs an operation for a context in a task of its own, its result is delivered as an
    /// event.
    pub(crate) fn suspend<F>(&self, id: ContextId, operation: F)
    where
        F: Future<Output = Continuation> + Send + 'static,
    {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let continuation = operation.await;
            // The driver is gone if sending fails, nobody is interested in the result then
            let _ = sender.send(Event::Context(id, continuation));
        });
    }

    /// Delivers a continuation through the event queue rather than synchronously
    pub(crate) fn defer(&self, id: ContextId, continuation: Continuation) {
        let _ = self.sender.send(Event::Context(id, continuation));
    }

    pub(crate) fn load(&mut self, resource: ResourceId) {
        let url = self.resources.get(resource).url().to_owned();
        let load = self
            .engine
            .load_input(url, crate::engine::LoadMode::Cached);
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let _ = sender.send(Event::ResourceLoaded(resource, Box::new(load.await)));
        });
    }

    pub(crate) fn wait_for_load(&mut self, resource: ResourceId, context: ContextId) {
        let waiters = self.loading.entry(resource).or_default();
        if !waiters.contains(&context) {
            waiters.push(context);
        }
    }

    fn resource_loaded(&mut self, id: ResourceId, resource: Resource) {
        trace!("loaded {} ({:?})", resource.url(), resource.state());
        *self.resources.get_mut(id) = resource;
        for context in self.loading.remove(&id).unwrap_or_default() {
            let ctx = &mut self.contexts[context.0];
            ctx.outstanding = ctx.outstanding.saturating_sub(1);
            if ctx.outstanding == 0 && ctx.phase == Phase::Fetching {
                self.inputs_ready(context);
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::ResourceLoaded(id, resource) => self.resource_loaded(id, *resource),
            Event::Context(id, continuation) => {
                if self.contexts[id.0].is_finished() {
                    debug!("ignoring {continuation:?} for finished context {id:?}");
                    return;
                }
                self.resume(id, continuation);
            }
        }
    }

    /// Processes events until `done` is satisfied or `deadline` passes. Returns whether `done`
    /// was satisfied.
    pub(crate) async fn run_until(
        &mut self,
        deadline: Option<Instant>,
        done: impl Fn(&Self) -> bool,
    ) -> bool {
        loop {
            if done(self) {
                return true;
            }
            let event = match deadline {
                Some(deadline) => tokio::select! {
                    event = self.receiver.recv() => event,
                    _ = sleep_until(deadline) => return done(self),
                },
                None => self.receiver.recv().await,
            };
            match event {
                Some(event) => self.handle(event),
                None => return done(self),
            }
        }
    }

    pub(crate) fn all_finished(&self) -> bool {
        self.contexts.iter().all(Context::is_finished)
    }

    /// Lets the contexts run to completion after the request has been answered. Stops early
    /// on engine shutdown.
    pub(crate) async fn run_to_completion(mut self) {
        self.detached = true;
        let mut shutdown = self.engine.shutdown_signal();
        let pending = self.contexts.iter().filter(|ctx| !ctx.is_finished()).count();
        if pending > 0 {
            debug!("{pending} rewrites continue in the background");
        }
        tokio::select! {
            _ = self.run_until(None, Self::all_finished) => {}
            _ = shutdown.wait_for(|shutdown| *shutdown) => {
                debug!("abandoning background rewrites on shutdown");
            }
        }
    }

    /// Hands the remaining work over to the engine
    pub(crate) fn detach(self) {
        if self.all_finished() {
            return;
        }
        let engine = self.engine.clone();
        engine.spawn_background(self.run_to_completion());
    }

    /// Creates a context for the given slots and starts it once its predecessors are done.
    pub(crate) fn initiate(
        &mut self,
        filter: Arc<dyn RewriteFilter>,
        slots: Vec<SlotId>,
        resource_context: ResourceContext,
        parent: Option<(ContextId, usize)>,
    ) -> ContextId {
        self.initiate_with(filter, slots, resource_context, parent, false)
    }

    pub(crate) fn initiate_with(
        &mut self,
        filter: Arc<dyn RewriteFilter>,
        slots: Vec<SlotId>,
        resource_context: ResourceContext,
        parent: Option<(ContextId, usize)>,
        force_rewrite: bool,
    ) -> ContextId {
        let id = ContextId(self.contexts.len());
        let mut predecessors = Vec::new();
        for slot in &slots {
            if let Some(predecessor) = self.slots[slot.0].attach(id) {
                if !predecessors.contains(&predecessor) {
                    predecessors.push(predecessor);
                }
            }
        }

        let mut context = Context::new(filter, slots, resource_context, parent);
        context.force_rewrite = force_rewrite;
        for predecessor in predecessors {
            let predecessor = &mut self.contexts[predecessor.0];
            if !predecessor.is_finished() {
                predecessor.successors.push(id);
                context.waiting += 1;
                context.slow |= predecessor.slow;
            }
        }
        trace!(
            "initiated {} context {id:?} waiting for {} predecessors",
            context.filter.id(),
            context.waiting
        );
        let waiting = context.waiting;
        self.contexts.push(context);
        if parent.is_none() {
            self.render_queue.push(id);
        }
        if waiting == 0 {
            self.start(id);
        }
        id
    }

    pub(crate) fn context(&self, id: ContextId) -> &Context {
        &self.contexts[id.0]
    }

    /// Marks a context and everything depending on it as slow. Contexts created later inherit
    /// slowness when they are initiated.
    pub(crate) fn mark_slow(&mut self, id: ContextId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let ctx = &mut self.contexts[id.0];
            if ctx.slow {
                continue;
            }
            ctx.slow = true;
            stack.extend(ctx.successors.iter().copied());
            stack.extend(ctx.repeated.iter().copied());
            stack.extend(
                ctx.nested
                    .iter()
                    .flatten()
                    .filter_map(|child| child.context),
            );
        }
    }
}
