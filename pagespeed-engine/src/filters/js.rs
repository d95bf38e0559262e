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

//! A rudimentary JavaScript minifier (`jm`)

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::content_type::ContentType;
use crate::filter::{HtmlTarget, OutputContent, RewriteResult, SingleRewrite};
use crate::options::RewriteOptions;
use crate::resource::Resource;
use crate::user_agent::ResourceContext;

/// Drops comment lines, indentation and empty lines. Scripts above the size limit are
/// answered with [`RewriteResult::TooBusy`], so that nothing is recorded about them.
#[derive(Debug)]
pub struct JsMinifier {
    max_bytes: AtomicU64,
}

impl JsMinifier {
    /// Creates a minifier for scripts of up to `max_bytes` bytes
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes: AtomicU64::new(max_bytes),
        }
    }

    /// Changes the size limit
    pub fn set_max_bytes(&self, max_bytes: u64) {
        self.max_bytes.store(max_bytes, Ordering::Relaxed);
    }

    fn minify(script: &str) -> String {
        script
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl SingleRewrite for JsMinifier {
    fn id(&self) -> &'static str {
        "jm"
    }

    fn html_targets(&self) -> &[HtmlTarget] {
        &[HtmlTarget::SCRIPT]
    }

    fn rewrite_single(
        &self,
        input: &Resource,
        _context: &ResourceContext,
        _options: &RewriteOptions,
    ) -> RewriteResult {
        let size = u64::try_from(input.contents().len()).unwrap_or(u64::MAX);
        let max_bytes = self.max_bytes.load(Ordering::Relaxed);
        if size > max_bytes {
            debug!("{} exceeds {max_bytes} bytes", input.url());
            return RewriteResult::TooBusy;
        }

        let minified = Self::minify(&input.text());
        if minified.len() >= input.contents().len() {
            return RewriteResult::Failed;
        }
        RewriteResult::Ok(OutputContent::new(minified, ContentType::javascript()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn script(contents: &str) -> Resource {
        Resource::loaded(
            "http://test.com/x.js",
            HeaderMap::new(),
            contents.to_owned(),
            Default::default(),
        )
    }

    #[test]
    fn minifies() {
        let minifier = JsMinifier::new(1000);
        let result = minifier.rewrite_single(
            &script("// comment\n  var a = 1;\n\n  a++;\n"),
            &ResourceContext::default(),
            &RewriteOptions::default(),
        );
        let RewriteResult::Ok(output) = result else {
            panic!("unexpected {result:?}");
        };
        assert_eq!(output.contents, "var a = 1;\na++;");
        assert!(matches!(
            minifier.rewrite_single(
                &script("a();"),
                &ResourceContext::default(),
                &RewriteOptions::default()
            ),
            RewriteResult::Failed
        ));
    }

    #[test]
    fn size_limit() {
        let minifier = JsMinifier::new(5);
        let input = script("  var a = 1;\n");
        let context = ResourceContext::default();
        let options = RewriteOptions::default();
        assert!(matches!(
            minifier.rewrite_single(&input, &context, &options),
            RewriteResult::TooBusy
        ));
        minifier.set_max_bytes(100);
        assert!(matches!(
            minifier.rewrite_single(&input, &context, &options),
            RewriteResult::Ok(_)
        ));
    }
}
