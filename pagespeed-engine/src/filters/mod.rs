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

//! Filters shipped with the engine

mod combine;
mod css_urls;
mod extend;
mod image;
mod in_place;
mod js;
mod text;

use std::sync::Arc;

use crate::filter::{OutputKind, RewriteFilter, SingleRewriteFilter};

pub use combine::CssCombiner;
pub use css_urls::CssUrlRewriter;
pub use extend::CacheExtender;
pub use image::{ImageRewriter, ImageTransformer, NullImageTransformer};
pub use in_place::InPlaceRewriter;
pub use js::JsMinifier;
pub use text::{TrimWhitespace, UpperCase};

/// The filters registered by [`crate::EngineBuilder::with_default_filters`]. Combined outputs
/// are limited to `max_bytes` bytes and `max_segment` characters of URL name.
pub fn default_filters(max_bytes: u64, max_segment: usize) -> Vec<Arc<dyn RewriteFilter>> {
    let trim: Arc<dyn RewriteFilter> =
        Arc::new(SingleRewriteFilter::new(TrimWhitespace::new(OutputKind::Rewritten)));
    let minify: Arc<dyn RewriteFilter> = Arc::new(SingleRewriteFilter::new(JsMinifier::new(
        10 * 1024 * 1024,
    )));
    let image: Arc<dyn RewriteFilter> = Arc::new(SingleRewriteFilter::new(ImageRewriter::new(
        Arc::new(NullImageTransformer),
    )));
    let extend: Arc<dyn RewriteFilter> = Arc::new(SingleRewriteFilter::new(CacheExtender));

    vec![
        trim.clone(),
        Arc::new(SingleRewriteFilter::new(UpperCase::new(OutputKind::Rewritten))),
        Arc::new(CssCombiner::new(max_bytes, max_segment)),
        minify.clone(),
        extend.clone(),
        Arc::new(CssUrlRewriter::new(extend)),
        image.clone(),
        Arc::new(InPlaceRewriter::new(trim, minify, image)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn unique_ids() {
        let filters = default_filters(1024, 100);
        let ids: HashSet<_> = filters.iter().map(|filter| filter.id()).collect();
        assert_eq!(ids.len(), filters.len());
        for id in ["tw", "uc", "cc", "jm", "ce", "cf", "ic", "aj"] {
            assert!(ids.contains(id), "{id}");
        }
    }
}
