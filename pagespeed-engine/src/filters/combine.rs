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

//! Combining adjacent stylesheets (`cc`)

use std::sync::Arc;

use crate::combiner::ResourceCombiner;
use crate::content_type::ContentType;
use crate::driver::HtmlScope;
use crate::filter::{
    HtmlFilter, HtmlTarget, OutputContent, PartitionPlan, RewriteFilter, RewriteJob,
    RewriteResult, RewriteStep, SlotRender,
};
use crate::html::ElementId;
use crate::options::RewriteOptions;
use crate::resource::Resource;
use crate::slot::SlotId;
use crate::user_agent::ResourceContext;

/// Combines stylesheets linked one after another into a single stylesheet. The first link
/// refers to the combination, the others are removed.
#[derive(Debug)]
pub struct CssCombiner {
    max_bytes: u64,
    max_segment: usize,
}

impl CssCombiner {
    /// Creates a combiner producing outputs of at most `max_bytes` bytes with URL names of at
    /// most `max_segment` characters
    pub fn new(max_bytes: u64, max_segment: usize) -> Self {
        Self {
            max_bytes,
            max_segment,
        }
    }
}

impl RewriteFilter for CssCombiner {
    fn id(&self) -> &'static str {
        "cc"
    }

    fn optimization_only(&self) -> bool {
        false
    }

    fn requires_all_inputs(&self) -> bool {
        false
    }

    fn partition(
        &self,
        inputs: &[Resource],
        options: &RewriteOptions,
    ) -> Option<Vec<PartitionPlan>> {
        let max_bytes = self.max_bytes.min(options.max_combined_bytes);
        Some(ResourceCombiner::new(max_bytes, self.max_segment).partition(inputs))
    }

    fn rewrite(&self, job: &RewriteJob) -> RewriteStep {
        RewriteStep::Done(RewriteResult::Ok(OutputContent::new(
            ResourceCombiner::combine(&job.inputs, "\n"),
            ContentType::css(),
        )))
    }

    fn render_slot(&self, position: usize, optimizable: bool) -> SlotRender {
        match (optimizable, position) {
            (false, _) => SlotRender::Leave,
            (true, 0) => SlotRender::Url,
            (true, _) => SlotRender::Delete,
        }
    }

    fn html_filter(self: Arc<Self>) -> Option<Box<dyn HtmlFilter>> {
        Some(Box::new(CombineLinks {
            filter: self,
            pending: Vec::new(),
        }))
    }
}

/// Collects stylesheet links until something other than whitespace separates them
struct CombineLinks {
    filter: Arc<CssCombiner>,
    pending: Vec<SlotId>,
}

impl CombineLinks {
    fn initiate(&mut self, scope: &mut HtmlScope<'_>) {
        let slots = std::mem::take(&mut self.pending);
        if slots.len() > 1 {
            scope.initiate(self.filter.clone(), slots, ResourceContext::default());
        }
    }
}

impl HtmlFilter for CombineLinks {
    fn start_element(&mut self, scope: &mut HtmlScope<'_>, element: ElementId) {
        let is_stylesheet = scope.element(element).is_some_and(|data| {
            HtmlTarget::STYLESHEET.matches(data) && data.attribute("media").is_none()
        });
        if !is_stylesheet {
            self.initiate(scope);
            return;
        }
        match scope.html_slot(element, HtmlTarget::STYLESHEET.attribute) {
            Some(slot) => self.pending.push(slot),
            None => self.initiate(scope),
        }
    }

    fn characters(&mut self, scope: &mut HtmlScope<'_>, text: &str) {
        if !text.trim().is_empty() {
            self.initiate(scope);
        }
    }

    fn flush(&mut self, scope: &mut HtmlScope<'_>) {
        self.initiate(scope);
    }
}
