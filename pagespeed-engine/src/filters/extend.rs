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

//! Cache extension (`ce`): resources are served unchanged under a versioned URL, which makes
//! them cacheable for a year.

use crate::content_type::ContentType;
use crate::filter::{HtmlTarget, OutputContent, OutputKind, RewriteResult, SingleRewrite};
use crate::options::RewriteOptions;
use crate::resource::Resource;
use crate::user_agent::ResourceContext;

/// The cache extender. Outputs are identical to the inputs, so they aren't stored.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheExtender;

impl SingleRewrite for CacheExtender {
    fn id(&self) -> &'static str {
        "ce"
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::OnTheFly
    }

    fn html_targets(&self) -> &[HtmlTarget] {
        &[HtmlTarget::IMAGE, HtmlTarget::SCRIPT]
    }

    fn rewrite_single(
        &self,
        input: &Resource,
        _context: &ResourceContext,
        _options: &RewriteOptions,
    ) -> RewriteResult {
        let Some(content_type) = input
            .content_type()
            .cloned()
            .or_else(|| ContentType::from_path(input.url()))
        else {
            return RewriteResult::Failed;
        };
        RewriteResult::Ok(OutputContent::new(input.contents().clone(), content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    fn unchanged_contents() {
        let input = Resource::loaded(
            "http://test.com/logo.png",
            HeaderMap::new(),
            &b"\x89PNG"[..],
            Default::default(),
        );
        let result = CacheExtender.rewrite_single(
            &input,
            &ResourceContext::default(),
            &RewriteOptions::default(),
        );
        let RewriteResult::Ok(output) = result else {
            panic!("unexpected {result:?}");
        };
        assert_eq!(output.contents, &b"\x89PNG"[..]);
        assert_eq!(output.content_type.mime(), "image/png");

        let unknown = Resource::loaded(
            "http://test.com/data",
            HeaderMap::new(),
            "x",
            Default::default(),
        );
        assert!(matches!(
            CacheExtender.rewrite_single(
                &unknown,
                &ResourceContext::default(),
                &RewriteOptions::default()
            ),
            RewriteResult::Failed
        ));
    }
}
