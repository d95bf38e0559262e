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

//! Simple text transformations, mostly useful to exercise the engine

use crate::content_type::ContentType;
use crate::filter::{HtmlTarget, OutputContent, OutputKind, RewriteResult, SingleRewrite};
use crate::options::RewriteOptions;
use crate::resource::Resource;
use crate::user_agent::ResourceContext;

fn output_type(input: &Resource) -> ContentType {
    input
        .content_type()
        .cloned()
        .or_else(|| ContentType::from_path(input.url()))
        .unwrap_or_else(ContentType::css)
}

fn transformed(input: &Resource, output: String) -> RewriteResult {
    if output.as_bytes() == input.contents().as_ref() {
        RewriteResult::Failed
    } else {
        RewriteResult::Ok(OutputContent::new(output, output_type(input)))
    }
}

/// Removes leading and trailing whitespace from stylesheets (`tw`)
#[derive(Debug)]
pub struct TrimWhitespace {
    kind: OutputKind,
}

impl TrimWhitespace {
    /// Creates the filter, producing outputs of the given kind
    pub fn new(kind: OutputKind) -> Self {
        Self { kind }
    }
}

impl SingleRewrite for TrimWhitespace {
    fn id(&self) -> &'static str {
        "tw"
    }

    fn output_kind(&self) -> OutputKind {
        self.kind
    }

    fn html_targets(&self) -> &[HtmlTarget] {
        &[HtmlTarget::STYLESHEET]
    }

    fn rewrite_single(
        &self,
        input: &Resource,
        _context: &ResourceContext,
        _options: &RewriteOptions,
    ) -> RewriteResult {
        transformed(input, input.text().trim().to_owned())
    }
}

/// Converts stylesheets to upper case (`uc`)
#[derive(Debug)]
pub struct UpperCase {
    kind: OutputKind,
}

impl UpperCase {
    /// Creates the filter, producing outputs of the given kind
    pub fn new(kind: OutputKind) -> Self {
        Self { kind }
    }
}

impl SingleRewrite for UpperCase {
    fn id(&self) -> &'static str {
        "uc"
    }

    fn output_kind(&self) -> OutputKind {
        self.kind
    }

    fn html_targets(&self) -> &[HtmlTarget] {
        &[HtmlTarget::STYLESHEET]
    }

    fn rewrite_single(
        &self,
        input: &Resource,
        _context: &ResourceContext,
        _options: &RewriteOptions,
    ) -> RewriteResult {
        transformed(input, input.text().to_uppercase())
    }
}
