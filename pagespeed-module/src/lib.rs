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

//! # Pagespeed Module for Pingora
//!
//! This crate allows extending [Pingora Proxy](https://github.com/cloudflare/pingora) with the
//! capability to serve a directory of HTML documents while optimizing the resources they refer
//! to, using the rewrite engine of the `pagespeed-engine` crate.
//!
//! ## Supported functionality
//!
//! * HTML documents (`.html` and `.htm` files, `index.html` for directories) are rewritten by
//!   the filters listed in `enabled_filters`
//! * Requests for rewritten resources (`<name>.pagespeed.<filter>.<hash>.<ext>`) are served
//!   from the cache or reconstructed from their inputs
//! * Other files are served as they are or, with `in_place_rewriting` enabled, optimized at
//!   their original URLs once an optimized version is known
//! * Inputs below the base URL are read from the root directory rather than fetched
//!
//! ## Code example
//!
//! You will typically create a [`PagespeedHandler`] instance and make your server call it during
//! the `request_filter` stage. It handles all requests so that subsequent stages won’t be reached
//! at all.
//!
//! ```rust,no_run
//! use clap::Parser;
//! use pagespeed_module::{PagespeedConf, PagespeedHandler, PagespeedOpt};
//! use pagespeed_utils::{FromYaml, RequestFilter};
//!
//! let opt = PagespeedOpt::parse();
//! let mut conf = PagespeedConf::load_from_files(&["pagespeed.yaml"]).unwrap();
//! conf.merge_with_opt(opt);
//!
//! let handler = PagespeedHandler::new(conf).unwrap();
//!
//! // Call handler.handle(session, ctx) from ProxyHttp::request_filter
//! ```
//!
//! ## Configuration
//!
//! Engine settings are listed at the top level of the configuration file, next to the module’s
//! own settings:
//!
//! ```yaml
//! root: /var/www/html
//! base_url: http://example.com/
//! enabled_filters:
//! - cc
//! - jm
//! render_deadline_ms: 20
//! in_place_rewriting: true
//! ```

mod configuration;
mod handler;
#[cfg(test)]
mod tests;

pub use configuration::{PagespeedConf, PagespeedOpt};
pub use handler::{PagespeedHandler, Reply};
