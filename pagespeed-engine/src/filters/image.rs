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

//! Image rewriting (`ic`). The actual image processing is up to an [`ImageTransformer`], the
//! filter takes care of the desired dimensions and of encoding them into the output URL.

use bytes::Bytes;
use log::trace;
use std::fmt::Debug;
use std::sync::Arc;

use crate::content_type::{ContentKind, ContentType};
use crate::encoder::{ImageUrlEncoder, UrlSegmentEncoder};
use crate::filter::{HtmlTarget, OutputContent, RewriteResult, SingleRewrite};
use crate::html::Element;
use crate::options::RewriteOptions;
use crate::resource::Resource;
use crate::user_agent::{ResourceContext, UserAgentInfo};

/// Image processing backend
pub trait ImageTransformer: Debug + Send + Sync {
    /// Produces an optimized version of the image for the given context. `None` if the image
    /// cannot be improved.
    fn transform(
        &self,
        image: &[u8],
        content_type: &ContentType,
        context: &ResourceContext,
    ) -> Option<(Bytes, ContentType)>;
}

/// A transformer that never changes anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullImageTransformer;

impl ImageTransformer for NullImageTransformer {
    fn transform(
        &self,
        _image: &[u8],
        _content_type: &ContentType,
        _context: &ResourceContext,
    ) -> Option<(Bytes, ContentType)> {
        None
    }
}

/// The image rewriter
#[derive(Debug)]
pub struct ImageRewriter {
    transformer: Arc<dyn ImageTransformer>,
}

impl ImageRewriter {
    /// Creates an image rewriter delegating to `transformer`
    pub fn new(transformer: Arc<dyn ImageTransformer>) -> Self {
        Self { transformer }
    }
}

fn dimension(element: &Element, name: &str) -> Option<u32> {
    element.attribute(name)?.trim().parse().ok()
}

impl SingleRewrite for ImageRewriter {
    fn id(&self) -> &'static str {
        "ic"
    }

    fn encoder(&self) -> &dyn UrlSegmentEncoder {
        &ImageUrlEncoder
    }

    fn html_targets(&self) -> &[HtmlTarget] {
        &[HtmlTarget::IMAGE]
    }

    fn element_context(&self, element: &Element, user_agent: &UserAgentInfo) -> ResourceContext {
        let dimensions = dimension(element, "width").zip(dimension(element, "height"));
        ResourceContext {
            webp: user_agent.accepts_webp,
            small_screen: user_agent.is_mobile,
            dimensions,
        }
    }

    fn rewrite_single(
        &self,
        input: &Resource,
        context: &ResourceContext,
        _options: &RewriteOptions,
    ) -> RewriteResult {
        let Some(content_type) = input
            .content_type()
            .cloned()
            .or_else(|| ContentType::from_path(input.url()))
            .filter(|content_type| content_type.kind() == ContentKind::Image)
        else {
            return RewriteResult::Failed;
        };

        match self
            .transformer
            .transform(input.contents(), &content_type, context)
        {
            Some((image, output_type))
                if image.len() < input.contents().len() || output_type != content_type =>
            {
                RewriteResult::Ok(OutputContent::new(image, output_type))
            }
            _ => {
                trace!("{} cannot be improved", input.url());
                RewriteResult::Failed
            }
        }
    }
}
