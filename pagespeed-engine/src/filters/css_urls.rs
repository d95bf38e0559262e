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

//! Rewriting the URLs referenced by stylesheets (`cf`). Each referenced resource is rewritten
//! by a nested filter, the stylesheet is then re-emitted with the new URLs.

use log::trace;
use std::sync::Arc;
use url::Url;

use crate::content_type::ContentType;
use crate::css::{find_urls, is_rewritable_url, replace_urls, CssUrl};
use crate::driver::HtmlScope;
use crate::filter::{
    HtmlFilter, HtmlTarget, NestedRequest, NestedResult, OutputContent, RewriteFilter,
    RewriteJob, RewriteResult, RewriteStep,
};
use crate::html::ElementId;
use crate::namer::{directory_of, relative_url};
use crate::user_agent::ResourceContext;

/// Rewrites stylesheets, passing every URL they reference to a nested filter
#[derive(Debug)]
pub struct CssUrlRewriter {
    nested: Arc<dyn RewriteFilter>,
}

impl CssUrlRewriter {
    /// Creates the filter, referenced resources are rewritten by `nested`
    pub fn new(nested: Arc<dyn RewriteFilter>) -> Self {
        Self { nested }
    }

    /// URLs of the stylesheet along with the positions of those that can be rewritten
    fn references(css: &str) -> (Vec<CssUrl>, Vec<usize>) {
        let urls = find_urls(css);
        let rewritable = urls
            .iter()
            .enumerate()
            .filter(|(_, url)| is_rewritable_url(&url.url))
            .map(|(index, _)| index)
            .collect();
        (urls, rewritable)
    }
}

impl RewriteFilter for CssUrlRewriter {
    fn id(&self) -> &'static str {
        "cf"
    }

    fn rewrite(&self, job: &RewriteJob) -> RewriteStep {
        let Some(input) = job.inputs.first() else {
            return RewriteStep::Done(RewriteResult::Failed);
        };
        let (urls, rewritable) = Self::references(&input.text());
        if rewritable.is_empty() {
            return RewriteStep::Done(RewriteResult::Failed);
        }
        trace!("{} references {} resources", input.url(), rewritable.len());
        RewriteStep::Nested(
            rewritable
                .into_iter()
                .map(|index| NestedRequest {
                    filter: self.nested.clone(),
                    url: urls[index].url.clone(),
                })
                .collect(),
        )
    }

    fn harvest(&self, job: &RewriteJob, nested: &[NestedResult]) -> RewriteResult {
        let Some(input) = job.inputs.first() else {
            return RewriteResult::Failed;
        };
        let Ok(url) = Url::parse(input.url()) else {
            return RewriteResult::Failed;
        };
        let directory = directory_of(&url);

        let css = input.text();
        let (urls, rewritable) = Self::references(&css);
        let replacements: Vec<_> = rewritable
            .into_iter()
            .zip(nested)
            .filter(|(index, result)| urls[*index].url == result.url)
            .filter_map(|(index, result)| {
                let rendered = result.rendered_url.as_deref()?;
                Some((index, relative_url(&directory, rendered)))
            })
            .collect();
        if replacements.is_empty() {
            return RewriteResult::Failed;
        }
        RewriteResult::Ok(OutputContent::new(
            replace_urls(&css, &urls, &replacements),
            ContentType::css(),
        ))
    }

    fn html_filter(self: Arc<Self>) -> Option<Box<dyn HtmlFilter>> {
        Some(Box::new(StylesheetLinks { filter: self }))
    }
}

struct StylesheetLinks {
    filter: Arc<CssUrlRewriter>,
}

impl HtmlFilter for StylesheetLinks {
    fn start_element(&mut self, scope: &mut HtmlScope<'_>, element: ElementId) {
        if !scope
            .element(element)
            .is_some_and(|data| HtmlTarget::STYLESHEET.matches(data))
        {
            return;
        }
        if let Some(slot) = scope.html_slot(element, HtmlTarget::STYLESHEET.attribute) {
            scope.initiate(self.filter.clone(), vec![slot], ResourceContext::default());
        }
    }
}
