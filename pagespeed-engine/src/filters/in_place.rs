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

//! The filter behind in-place optimization (`aj`): resources requested at their original URL
//! are optimized by the filter responsible for their content type.

use std::sync::Arc;

use crate::content_type::{ContentKind, ContentType};
use crate::filter::{NestedResult, RewriteFilter, RewriteJob, RewriteResult, RewriteStep};
use crate::resource::Resource;

/// Delegates to a stylesheet, script or image filter depending on the input
#[derive(Debug)]
pub struct InPlaceRewriter {
    css: Arc<dyn RewriteFilter>,
    javascript: Arc<dyn RewriteFilter>,
    image: Arc<dyn RewriteFilter>,
}

impl InPlaceRewriter {
    /// Creates the filter from the filters responsible for the individual content types
    pub fn new(
        css: Arc<dyn RewriteFilter>,
        javascript: Arc<dyn RewriteFilter>,
        image: Arc<dyn RewriteFilter>,
    ) -> Self {
        Self {
            css,
            javascript,
            image,
        }
    }

    fn delegate(&self, job: &RewriteJob) -> Option<&Arc<dyn RewriteFilter>> {
        let input: &Resource = job.inputs.first()?;
        let content_type = input
            .content_type()
            .cloned()
            .or_else(|| ContentType::from_path(input.url()))?;
        match content_type.kind() {
            ContentKind::Css => Some(&self.css),
            ContentKind::JavaScript => Some(&self.javascript),
            ContentKind::Image => Some(&self.image),
            _ => None,
        }
    }
}

impl RewriteFilter for InPlaceRewriter {
    fn id(&self) -> &'static str {
        "aj"
    }

    fn rewrite(&self, job: &RewriteJob) -> RewriteStep {
        match self.delegate(job) {
            Some(filter) => filter.rewrite(job),
            None => RewriteStep::Done(RewriteResult::Failed),
        }
    }

    fn harvest(&self, job: &RewriteJob, nested: &[NestedResult]) -> RewriteResult {
        match self.delegate(job) {
            Some(filter) => filter.harvest(job, nested),
            None => RewriteResult::Failed,
        }
    }
}
