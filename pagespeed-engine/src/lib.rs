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

//! # Resource rewriting engine
//!
//! This crate rewrites the resources referenced by HTML documents (stylesheets, scripts,
//! images) into optimized versions served under versioned URLs of the form
//! `<name>.pagespeed.<filter-id>.<hash>.<ext>`.
//!
//! ## Supported functionality
//!
//! * Slots abstracting the places referring to resources, so that chained filters see each
//!   other's outputs
//! * Rewrite contexts partitioning their inputs, recording every decision in a metadata cache
//!   keyed by the inputs and revalidating expired records by refetching the inputs
//! * Render deadlines: rewrites that don't finish in time continue in the background and only
//!   benefit later requests
//! * Nested rewrites, e.g. the resources referenced by a stylesheet
//! * Reconstruction of rewritten resources from their URL alone, with a fallback to the
//!   unoptimized input when rewriting takes too long
//! * Optimizing resources requested at their original URLs ("in place")
//! * In-memory, file and two-level caches, a rate-controlling fetcher and filesystem inputs
//!
//! ## Code example
//!
//! ```rust,no_run
//! use http::HeaderMap;
//! use pagespeed_engine::{Engine, RewriteOptions};
//!
//! # async fn run() -> Result<(), Box<pingora_error::Error>> {
//! let options = RewriteOptions {
//!     enabled_filters: vec!["tw".to_owned(), "cc".to_owned()],
//!     ..Default::default()
//! };
//! let engine = Engine::builder(options).with_default_filters().build()?;
//!
//! let mut driver = engine.new_driver("http://example.com/", &HeaderMap::new())?;
//! driver.parse("<link rel=stylesheet href=a.css><link rel=stylesheet href=b.css>");
//! let html = driver.finish().await;
//!
//! // Requests for the URLs in `html` are answered by `engine.fetch_resource()`.
//! # let _ = html;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod combiner;
pub mod content_type;
pub mod css;
mod driver;
pub mod encoder;
mod engine;
pub mod fetch;
pub mod filter;
pub mod filters;
pub mod hasher;
mod headers;
pub mod html;
pub mod lock;
mod metadata;
pub mod namer;
mod options;
pub mod partitions;
mod reconstruct;
pub mod resource;
pub mod slot;
pub mod stats;
pub mod timer;
pub mod user_agent;
mod workers;

#[cfg(test)]
mod tests;

pub use driver::{ContextId, HtmlScope, RewriteDriver};
pub use engine::{Engine, EngineBuilder};
pub use headers::ServedResource;
pub use options::RewriteOptions;
pub use reconstruct::IN_PLACE_FILTER;
