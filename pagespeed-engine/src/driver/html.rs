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

//! HTML rewriting: feeding the document to filters, waiting for rewrites at flush time and
//! rendering the results that made it in time.

use http::HeaderMap;
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::engine::Engine;
use crate::filter::{HtmlFilter, RewriteFilter};
use crate::html::{Added, Element, ElementId, Lexer, Token};
use crate::namer::{directory_of, relative_url};
use crate::options::RewriteOptions;
use crate::slot::{SlotFlags, SlotId};
use crate::stats::Counter;
use crate::user_agent::{ResourceContext, UserAgentInfo};

use super::{ContextId, DriverState, Mode, Phase};

/// Rewrites one HTML document. Feed the document with [`RewriteDriver::parse`], collect output
/// with [`RewriteDriver::flush`] and complete it with [`RewriteDriver::finish`].
pub struct RewriteDriver {
    state: DriverState,
    lexer: Lexer,
    /// Per-document filters along with the id of the filter that created them
    filters: Vec<(&'static str, Box<dyn HtmlFilter>)>,
    started: bool,
}

impl std::fmt::Debug for RewriteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteDriver")
            .field("base_url", &self.state.base_url.as_str())
            .field("contexts", &self.state.contexts.len())
            .finish()
    }
}

impl RewriteDriver {
    pub(crate) fn new(engine: Engine, base_url: Url, request_headers: &HeaderMap) -> Self {
        let filters = engine
            .options()
            .enabled_filters
            .iter()
            .filter_map(|id| engine.filter(id))
            .filter_map(|filter| {
                let id = filter.id();
                filter.clone().html_filter().map(|html| (id, html))
            })
            .collect();
        Self {
            state: DriverState::new(engine, Mode::Html, base_url, request_headers),
            lexer: Lexer::default(),
            filters,
            started: false,
        }
    }

    /// URL relative references in the document are resolved against, changed by `<base>`
    pub fn base_url(&self) -> &Url {
        &self.state.base_url
    }

    /// Processes a chunk of the document. Filters see the elements immediately, output only
    /// becomes available once the driver is flushed.
    pub fn parse(&mut self, chunk: &str) {
        for token in self.lexer.feed(chunk) {
            self.token(token);
        }
    }

    fn token(&mut self, token: Token) {
        let mut scope = HtmlScope {
            state: &mut self.state,
        };
        if !self.started {
            self.started = true;
            for (_, filter) in &mut self.filters {
                filter.start_document(&mut scope);
            }
        }

        match scope.state.document.push(token) {
            Added::Start(element) => {
                scope.update_base(element);
                for (_, filter) in &mut self.filters {
                    filter.start_element(&mut scope, element);
                }
            }
            Added::End(Some(element)) => {
                for (_, filter) in &mut self.filters {
                    filter.end_element(&mut scope, element);
                }
            }
            Added::Text(text) => {
                for (_, filter) in &mut self.filters {
                    filter.characters(&mut scope, &text);
                }
            }
            Added::End(None) | Added::Other => {}
        }
    }

    /// Waits for the rewrites initiated so far, up to the render deadline, and returns the
    /// document text accumulated since the previous flush. Rewrites missing the deadline don't
    /// change this document but continue running.
    pub async fn flush(&mut self) -> String {
        let mut scope = HtmlScope {
            state: &mut self.state,
        };
        for (_, filter) in &mut self.filters {
            filter.flush(&mut scope);
        }

        let deadline_ms = self.state.engine.options().render_deadline_ms;
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        let queue = self.state.render_queue.clone();
        let complete = self
            .state
            .run_until(Some(deadline), |state| {
                queue.iter().all(|id| {
                    let ctx = state.context(*id);
                    ctx.is_finished() || ctx.slow
                })
            })
            .await;
        if !complete {
            debug!("render deadline of {deadline_ms} ms exceeded");
        }
        let missed = self.state.render();

        let mut scope = HtmlScope {
            state: &mut self.state,
        };
        for id in missed {
            let filter_id = scope.state.contexts[id.0].filter.id();
            for (_, filter) in self
                .filters
                .iter_mut()
                .filter(|(owner, _)| *owner == filter_id)
            {
                filter.will_not_render(&mut scope, id);
            }
        }
        self.state.document.flush()
    }

    /// Completes the document and returns its remaining text. Rewrites still running are
    /// handed over to the engine.
    pub async fn finish(mut self) -> String {
        for token in self.lexer.finish() {
            self.token(token);
        }
        let html = self.flush().await;
        self.state.detach();
        html
    }
}

impl DriverState {
    /// Renders finished contexts in the order they were initiated. Unfinished ones are marked
    /// slow, they and everything depending on them will no longer be rendered. Returns the
    /// contexts that weren't finished.
    fn render(&mut self) -> Vec<ContextId> {
        let directory = directory_of(&self.base_url);
        let mut missed = Vec::new();
        for id in std::mem::take(&mut self.render_queue) {
            let ctx = &self.contexts[id.0];
            if !ctx.is_finished() {
                if !ctx.slow {
                    trace!("context {id:?} will not render, it missed the deadline");
                    self.engine.inner.stats.add(Counter::DeadlineExceeded);
                }
                self.mark_slow(id);
                missed.push(id);
                continue;
            }
            if ctx.slow || ctx.phase == Phase::Canceled {
                continue;
            }

            for slot in ctx.slots.clone() {
                let slot = &mut self.slots[slot.0];
                let SlotFlags {
                    was_optimized,
                    delete_element,
                    ..
                } = slot.flags();
                if was_optimized || delete_element {
                    let url = relative_url(&directory, self.resources.get(slot.resource()).url());
                    slot.render(&url, &mut self.document);
                }
            }
            self.contexts[id.0].rendered = true;
        }
        missed
    }
}

/// What HTML filters can access while observing a document
pub struct HtmlScope<'a> {
    state: &'a mut DriverState,
}

impl std::fmt::Debug for HtmlScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HtmlScope")
            .field("base_url", &self.state.base_url.as_str())
            .finish()
    }
}

impl HtmlScope<'_> {
    fn update_base(&mut self, element: ElementId) {
        let Some(href) = self
            .state
            .document
            .element(element)
            .filter(|data| data.name == "base")
            .and_then(|data| data.attribute("href"))
        else {
            return;
        };
        match self.state.base_url.join(href.trim()) {
            Ok(url) => {
                trace!("document base is now {url}");
                self.state.base_url = url;
            }
            Err(err) => debug!("ignoring invalid base URL {href}: {err}"),
        }
    }

    /// An element that hasn't been flushed yet
    pub fn element(&self, element: ElementId) -> Option<&Element> {
        self.state.document.element(element)
    }

    /// Current base URL of the document
    pub fn base_url(&self) -> &Url {
        &self.state.base_url
    }

    /// Capabilities of the client requesting the document
    pub fn user_agent(&self) -> &UserAgentInfo {
        &self.state.user_agent
    }

    /// Engine settings
    pub fn options(&self) -> &RewriteOptions {
        self.state.engine.options()
    }

    /// Resolves a reference against the base URL
    pub fn resolve(&self, url: &str) -> Option<Url> {
        self.state.base_url.join(url.trim()).ok()
    }

    /// The slot for the URL in an element attribute, `None` if the attribute is missing or
    /// the URL cannot be rewritten.
    pub fn html_slot(&mut self, element: ElementId, attribute: &str) -> Option<SlotId> {
        self.state.html_slot(element, attribute)
    }

    /// Slots a context rewrites
    pub fn context_slots(&self, context: ContextId) -> &[SlotId] {
        &self.state.context(context).slots
    }

    /// URL of the resource a slot currently refers to
    pub fn slot_url(&self, slot: SlotId) -> &str {
        self.state
            .resources
            .get(self.state.slots[slot.0].resource())
            .url()
    }

    /// Decisions about a slot that filters can influence
    pub fn slot_flags_mut(&mut self, slot: SlotId) -> &mut SlotFlags {
        &mut self.state.slots[slot.0].flags
    }

    /// Starts a rewrite of the given slots by `filter`
    pub fn initiate(
        &mut self,
        filter: Arc<dyn RewriteFilter>,
        slots: Vec<SlotId>,
        context: ResourceContext,
    ) -> ContextId {
        self.state.initiate(filter, slots, context, None)
    }
}
