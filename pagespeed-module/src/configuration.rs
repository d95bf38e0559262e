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

//! Data structures required for `PagespeedHandler` configuration

use clap::Parser;
use pagespeed_engine::RewriteOptions;
use serde::Deserialize;
use std::path::PathBuf;

/// Command line options of the pagespeed module
#[derive(Debug, Default, Parser)]
pub struct PagespeedOpt {
    /// The document root directory.
    #[clap(short, long)]
    pub root: Option<PathBuf>,

    /// The URL the document root is served under, e.g. http://example.com/
    #[clap(long)]
    pub base_url: Option<String>,

    /// Id of a filter to apply to HTML documents, e.g. tw or cc. This command line flag can be
    /// specified multiple times.
    #[clap(long)]
    pub enable_filter: Option<Vec<String>>,

    /// How long HTML responses wait for rewrites to complete, in milliseconds.
    #[clap(long)]
    pub render_deadline_ms: Option<u64>,

    /// Serve resources at their original URLs optimized once an optimized version is known.
    #[clap(long)]
    pub in_place_rewriting: Option<bool>,

    /// Directory to keep cached resources and metadata in.
    #[clap(long)]
    pub file_cache_path: Option<PathBuf>,
}

/// Configuration file settings of the pagespeed module
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PagespeedConf {
    /// The document root directory.
    pub root: Option<PathBuf>,

    /// The URL the document root is served under, `http://localhost:8080/` by default.
    pub base_url: Option<String>,

    /// Settings of the rewrite engine.
    #[serde(flatten)]
    pub rewrite: RewriteOptions,
}

impl PagespeedConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: PagespeedOpt) {
        if opt.root.is_some() {
            self.root = opt.root;
        }

        if opt.base_url.is_some() {
            self.base_url = opt.base_url;
        }

        if let Some(filters) = opt.enable_filter {
            self.rewrite.enabled_filters = filters;
        }

        if let Some(render_deadline_ms) = opt.render_deadline_ms {
            self.rewrite.render_deadline_ms = render_deadline_ms;
        }

        if let Some(in_place_rewriting) = opt.in_place_rewriting {
            self.rewrite.in_place_rewriting = in_place_rewriting;
        }

        if opt.file_cache_path.is_some() {
            self.rewrite.file_cache_path = opt.file_cache_path;
        }
    }
}
