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

//! The contract between filters and the rewrite engine.
//!
//! A filter is registered with the engine once and shared by all requests. It decides how
//! inputs are grouped into outputs ([`RewriteFilter::partition`]), produces the output of
//! each group ([`RewriteFilter::rewrite`]) and tells the engine what rendering a result
//! means for the slots involved ([`RewriteFilter::render_slot`]). Filters taking part in HTML
//! rewriting also produce a per-document [`HtmlFilter`] which observes the document and
//! initiates rewrites.

use bytes::Bytes;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::content_type::ContentType;
use crate::driver::{ContextId, HtmlScope};
use crate::encoder::{UrlMultipartEncoder, UrlSegmentEncoder};
use crate::html::{Element, ElementId};
use crate::options::RewriteOptions;
use crate::resource::Resource;
use crate::user_agent::{ResourceContext, UserAgentInfo};

/// How outputs of a filter are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Outputs are stored in the HTTP cache
    Rewritten,
    /// Outputs are cheap to produce and are reconstructed on demand rather than stored
    OnTheFly,
    /// Outputs are content extracted from a document into a separate resource
    Outlined,
}

/// What a reconstruction does if the requested hash is no longer current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMismatchPolicy {
    /// Redirect to the URL with the current hash
    Redirect,
    /// Serve the current output under the requested URL, cacheable only briefly
    ServeCurrent,
}

/// One output group: the inputs combined into a single output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Indices of the inputs, in the order they are passed to [`RewriteFilter::rewrite`]
    pub inputs: Vec<usize>,
    /// Whether the result depends on the input contents, in which case input hashes are
    /// recorded and used for revalidation. Otherwise only timestamps are recorded.
    pub include_hash: bool,
}

impl PartitionPlan {
    /// A partition of the given inputs depending on their contents
    pub fn new(inputs: Vec<usize>) -> Self {
        Self {
            inputs,
            include_hash: true,
        }
    }
}

/// Pending result of [`RewriteFilter::partition_async`]
pub type PartitionFuture = Pin<Box<dyn Future<Output = Option<Vec<PartitionPlan>>> + Send>>;

/// A rewrite to be performed for one partition
#[derive(Debug, Clone)]
pub struct RewriteJob {
    /// Index of the partition
    pub partition: usize,
    /// The partition's inputs, in partition order
    pub inputs: Vec<Resource>,
    /// Request properties the output may depend on
    pub resource_context: ResourceContext,
    /// Engine settings
    pub options: Arc<RewriteOptions>,
}

/// Contents produced by a rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputContent {
    /// The output bytes
    pub contents: Bytes,
    /// Content type of the output
    pub content_type: ContentType,
}

impl OutputContent {
    /// Creates output contents
    pub fn new(contents: impl Into<Bytes>, content_type: ContentType) -> Self {
        Self {
            contents: contents.into(),
            content_type,
        }
    }
}

/// Outcome of rewriting a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteResult {
    /// An optimized output was produced
    Ok(OutputContent),
    /// The inputs cannot be optimized, the original stays in place
    Failed,
    /// The rewrite was abandoned because of load, it should be retried later
    TooBusy,
}

/// A rewrite of a resource referenced by the input of another rewrite
#[derive(Debug, Clone)]
pub struct NestedRequest {
    /// Filter performing the nested rewrite
    pub filter: Arc<dyn RewriteFilter>,
    /// URL of the resource as written in the input, relative to the input's URL
    pub url: String,
}

/// Result of a nested rewrite as passed to [`RewriteFilter::harvest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedResult {
    /// URL as given in the request
    pub url: String,
    /// Absolute URL of the optimized resource, `None` if it could not be optimized
    pub rendered_url: Option<String>,
}

/// Result of [`RewriteFilter::rewrite`]
#[derive(Debug, Clone)]
pub enum RewriteStep {
    /// The rewrite is complete
    Done(RewriteResult),
    /// The rewrite depends on rewriting other resources first. Once these complete,
    /// [`RewriteFilter::harvest`] produces the result.
    Nested(Vec<NestedRequest>),
}

/// What rendering a result does to a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRender {
    /// Refer to the output
    Url,
    /// Remove the element, its content is part of another slot's output
    Delete,
    /// Keep referring to the original
    Leave,
}

/// A filter as registered with the engine
pub trait RewriteFilter: Debug + Send + Sync {
    /// Short id identifying the filter in rewritten URLs
    fn id(&self) -> &'static str;

    /// How outputs are stored
    fn output_kind(&self) -> OutputKind {
        OutputKind::Rewritten
    }

    /// Encoder packing input URLs into the output URL
    fn encoder(&self) -> &dyn UrlSegmentEncoder {
        &UrlMultipartEncoder
    }

    /// Whether serving the unoptimized input is an acceptable replacement for the output,
    /// true for filters that only make resources smaller or faster.
    fn optimization_only(&self) -> bool {
        true
    }

    /// Whether the rewrite fails if any input cannot be loaded. Otherwise unavailable inputs
    /// are left out of partitioning.
    fn requires_all_inputs(&self) -> bool {
        true
    }

    /// Behavior of reconstruction for outdated URLs
    fn hash_mismatch_policy(&self) -> HashMismatchPolicy {
        HashMismatchPolicy::Redirect
    }

    /// Extra data distinguishing the results for the same inputs and resource context
    fn cache_key_suffix(&self, _context: &ResourceContext) -> String {
        String::new()
    }

    /// Groups the inputs into output partitions. `None` means that the filter is too busy and
    /// the whole rewrite should be abandoned. Inputs that failed to load are passed as well,
    /// these should not be included in any partition.
    fn partition(
        &self,
        inputs: &[Resource],
        _options: &RewriteOptions,
    ) -> Option<Vec<PartitionPlan>> {
        if inputs.iter().all(Resource::is_loaded) {
            Some(vec![PartitionPlan::new((0..inputs.len()).collect())])
        } else {
            Some(Vec::new())
        }
    }

    /// Asynchronous variant of [`RewriteFilter::partition`] for filters that have to wait for
    /// something while partitioning. `None` means that the synchronous variant runs on a worker
    /// thread instead.
    fn partition_async(
        &self,
        _inputs: &[Resource],
        _options: &Arc<RewriteOptions>,
    ) -> Option<PartitionFuture> {
        None
    }

    /// Rewrites one partition. Runs on a worker thread.
    fn rewrite(&self, job: &RewriteJob) -> RewriteStep;

    /// Produces the result of a rewrite from the results of its nested rewrites. Runs on a
    /// worker thread once all nested rewrites completed.
    fn harvest(&self, _job: &RewriteJob, _nested: &[NestedResult]) -> RewriteResult {
        RewriteResult::Failed
    }

    /// Decides how to render the slot at `position` within a partition
    fn render_slot(&self, _position: usize, optimizable: bool) -> SlotRender {
        if optimizable {
            SlotRender::Url
        } else {
            SlotRender::Leave
        }
    }

    /// Creates the observer initiating this filter's rewrites in an HTML document, `None` if
    /// the filter doesn't rewrite HTML references.
    fn html_filter(self: Arc<Self>) -> Option<Box<dyn HtmlFilter>> {
        None
    }
}

/// Per-document observer of HTML events. Hooks are called in document order, contexts
/// initiated by them are rendered at the next flush if they complete in time.
pub trait HtmlFilter: Send {
    /// Called before the first element
    fn start_document(&mut self, _scope: &mut HtmlScope<'_>) {}

    /// Called for each start tag
    fn start_element(&mut self, _scope: &mut HtmlScope<'_>, _element: ElementId) {}

    /// Called for each end tag matching a start tag
    fn end_element(&mut self, _scope: &mut HtmlScope<'_>, _element: ElementId) {}

    /// Called for character data
    fn characters(&mut self, _scope: &mut HtmlScope<'_>, _text: &str) {}

    /// Called before the document is flushed
    fn flush(&mut self, _scope: &mut HtmlScope<'_>) {}

    /// Called during a flush for each context initiated by this filter that hasn't completed
    /// by the render deadline. The context keeps running but its result won't be rendered
    /// into this document.
    fn will_not_render(&mut self, _scope: &mut HtmlScope<'_>, _context: ContextId) {}
}

/// Elements an attribute rewriter is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtmlTarget {
    /// Element name
    pub element: &'static str,
    /// Attribute containing the URL
    pub attribute: &'static str,
    /// Required value of the `rel` attribute
    pub rel: Option<&'static str>,
}

impl HtmlTarget {
    /// `<link rel="stylesheet" href="...">`
    pub const STYLESHEET: Self = Self {
        element: "link",
        attribute: "href",
        rel: Some("stylesheet"),
    };

    /// `<script src="...">`
    pub const SCRIPT: Self = Self {
        element: "script",
        attribute: "src",
        rel: None,
    };

    /// `<img src="...">`
    pub const IMAGE: Self = Self {
        element: "img",
        attribute: "src",
        rel: None,
    };

    /// Checks whether an element matches
    pub fn matches(&self, element: &Element) -> bool {
        element.name == self.element
            && element.attribute(self.attribute).is_some()
            && self.rel.map_or(true, |rel| {
                element
                    .attribute("rel")
                    .is_some_and(|value| value.eq_ignore_ascii_case(rel))
            })
    }
}

/// A filter rewriting one resource into one output. Wrap in [`SingleRewriteFilter`] to
/// register with the engine.
pub trait SingleRewrite: Debug + Send + Sync {
    /// Short id identifying the filter in rewritten URLs
    fn id(&self) -> &'static str;

    /// How outputs are stored
    fn output_kind(&self) -> OutputKind {
        OutputKind::Rewritten
    }

    /// Encoder packing the input URL into the output URL
    fn encoder(&self) -> &dyn UrlSegmentEncoder {
        &UrlMultipartEncoder
    }

    /// See [`RewriteFilter::optimization_only`]
    fn optimization_only(&self) -> bool {
        true
    }

    /// Elements referencing resources this filter rewrites
    fn html_targets(&self) -> &[HtmlTarget] {
        &[]
    }

    /// Request properties relevant for rewriting the resource referenced by an element
    fn element_context(&self, _element: &Element, _user_agent: &UserAgentInfo) -> ResourceContext {
        ResourceContext::default()
    }

    /// Rewrites the input
    fn rewrite_single(
        &self,
        input: &Resource,
        context: &ResourceContext,
        options: &RewriteOptions,
    ) -> RewriteResult;
}

/// Adapts a [`SingleRewrite`] to the [`RewriteFilter`] interface: a single partition with a
/// single input.
#[derive(Debug)]
pub struct SingleRewriteFilter<R> {
    rewriter: R,
}

impl<R: SingleRewrite> SingleRewriteFilter<R> {
    /// Wraps a rewriter
    pub fn new(rewriter: R) -> Self {
        Self { rewriter }
    }

    /// The wrapped rewriter
    pub fn rewriter(&self) -> &R {
        &self.rewriter
    }
}

impl<R: SingleRewrite + 'static> RewriteFilter for SingleRewriteFilter<R> {
    fn id(&self) -> &'static str {
        self.rewriter.id()
    }

    fn output_kind(&self) -> OutputKind {
        self.rewriter.output_kind()
    }

    fn encoder(&self) -> &dyn UrlSegmentEncoder {
        self.rewriter.encoder()
    }

    fn optimization_only(&self) -> bool {
        self.rewriter.optimization_only()
    }

    fn partition(
        &self,
        inputs: &[Resource],
        _options: &RewriteOptions,
    ) -> Option<Vec<PartitionPlan>> {
        match inputs {
            [input] if input.is_loaded() => Some(vec![PartitionPlan::new(vec![0])]),
            _ => Some(Vec::new()),
        }
    }

    fn rewrite(&self, job: &RewriteJob) -> RewriteStep {
        RewriteStep::Done(match job.inputs.as_slice() {
            [input] => self
                .rewriter
                .rewrite_single(input, &job.resource_context, &job.options),
            _ => RewriteResult::Failed,
        })
    }

    fn html_filter(self: Arc<Self>) -> Option<Box<dyn HtmlFilter>> {
        if self.rewriter.html_targets().is_empty() {
            return None;
        }
        Some(Box::new(AttributeRewriter { filter: self }))
    }
}

/// Initiates a rewrite for every element matching one of the rewriter's targets
#[derive(Debug)]
struct AttributeRewriter<R> {
    filter: Arc<SingleRewriteFilter<R>>,
}

impl<R: SingleRewrite + 'static> HtmlFilter for AttributeRewriter<R> {
    fn start_element(&mut self, scope: &mut HtmlScope<'_>, element: ElementId) {
        let Some(data) = scope.element(element) else {
            return;
        };
        let Some(target) = self
            .filter
            .rewriter
            .html_targets()
            .iter()
            .find(|target| target.matches(data))
        else {
            return;
        };
        let context = self
            .filter
            .rewriter
            .element_context(data, scope.user_agent());
        if let Some(slot) = scope.html_slot(element, target.attribute) {
            scope.initiate(self.filter.clone(), vec![slot], context);
        }
    }
}
