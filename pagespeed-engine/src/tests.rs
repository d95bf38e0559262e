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

//! End-to-end scenarios: documents rewritten by drivers, rewritten resources reconstructed
//! and resources optimized in place.

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use pingora_error::{Error, ErrorType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use test_log::test;

use crate::cache::{CacheInterface, HttpCacheLookup, LruCache};
use crate::content_type::ContentType;
use crate::fetch::{
    CountingUrlFetcher, FetchResponse, MockUrlFetcher, UrlAsyncFetcher, WaitUrlFetcher,
};
use crate::filter::{
    HtmlFilter, HtmlTarget, OutputContent, PartitionFuture, PartitionPlan, RewriteFilter,
    RewriteJob, RewriteResult, RewriteStep, SingleRewrite, SingleRewriteFilter,
};
use crate::filters::JsMinifier;
use crate::hasher::{Hasher, MockHasher, Sha256Hasher};
use crate::html::ElementId;
use crate::partitions::OutputPartitions;
use crate::resource::Resource;
use crate::timer::MockTimer;
use crate::user_agent::ResourceContext;
use crate::workers::TOO_BUSY;
use crate::{ContextId, Engine, EngineBuilder, HtmlScope, RewriteOptions};

const DOCUMENT: &str = "http://test.com/index.html";

struct Fixture {
    engine: Engine,
    fetcher: Arc<MockUrlFetcher>,
    counting: Arc<CountingUrlFetcher>,
    timer: Arc<MockTimer>,
}

impl Fixture {
    fn new(options: RewriteOptions) -> Self {
        Self::custom(options, EngineBuilder::with_default_filters)
    }

    fn custom(
        options: RewriteOptions,
        customize: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        Self::with_timer(options, |builder, _| customize(builder))
    }

    /// Like [`Fixture::custom`], for filters that need access to the engine's clock
    fn with_timer(
        options: RewriteOptions,
        customize: impl FnOnce(EngineBuilder, &Arc<MockTimer>) -> EngineBuilder,
    ) -> Self {
        let timer = Arc::new(MockTimer::default());
        let fetcher = Arc::new(MockUrlFetcher::new());
        let counting = Arc::new(CountingUrlFetcher::new(fetcher.clone()));
        let builder = Engine::builder(options)
            .timer(timer.clone())
            .hasher(Arc::new(MockHasher::default()))
            .fetcher(counting.clone());
        Self {
            engine: customize(builder, &timer).build().unwrap(),
            fetcher,
            counting,
            timer,
        }
    }

    fn css(&self, url: &str, contents: &str) {
        self.fetcher.set_text(url, "text/css", contents.to_owned(), 100);
    }

    async fn rewrite(&self, html: &str) -> String {
        let mut driver = self
            .engine
            .new_driver(DOCUMENT, &HeaderMap::new())
            .unwrap();
        driver.parse(html);
        driver.finish().await
    }

    async fn cached_body(&self, url: &str) -> Option<Bytes> {
        match self.engine.http_cache().find(url).await {
            HttpCacheLookup::Found(value) => Some(value.body),
            _ => None,
        }
    }
}

/// Options enabling the given filters, with a render deadline long enough for every rewrite
/// to make it into the document
fn options(filters: &[&str]) -> RewriteOptions {
    RewriteOptions {
        enabled_filters: filters.iter().map(|id| (*id).to_owned()).collect(),
        render_deadline_ms: 60_000,
        ..Default::default()
    }
}

#[test(tokio::test)]
async fn rewrites_stylesheet() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "  a  ");

    for _ in 0..2 {
        let html = fixture.rewrite(r#"<link rel=stylesheet href="a.css">"#).await;
        assert_eq!(
            html,
            r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#
        );
    }

    let stats = fixture.engine.statistics();
    assert_eq!(stats.metadata_misses(), 1);
    assert_eq!(stats.metadata_hits(), 1);
    assert_eq!(stats.rewrites_executed(), 1);
    assert_eq!(fixture.counting.fetch_count(), 1);
    assert_eq!(
        fixture
            .cached_body("http://test.com/a.css.pagespeed.tw.0.css")
            .await
            .unwrap(),
        "a"
    );
}

#[test(tokio::test)]
async fn unoptimizable_result_is_recorded() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "b");

    for _ in 0..2 {
        let html = fixture.rewrite(r#"<link rel=stylesheet href="a.css">"#).await;
        assert_eq!(html, r#"<link rel=stylesheet href="a.css">"#);
    }

    let stats = fixture.engine.statistics();
    assert_eq!(stats.metadata_hits(), 1);
    assert_eq!(stats.rewrites_executed(), 1);
    assert_eq!(
        fixture
            .cached_body("http://test.com/a.css.pagespeed.tw.0.css")
            .await,
        None
    );
}

#[test(tokio::test)]
async fn identical_references_rewrite_once() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "  a  ");

    let html = fixture
        .rewrite("<link rel=stylesheet href=a.css>\n<link rel=stylesheet href=a.css>")
        .await;
    assert_eq!(
        html,
        concat!(
            "<link rel=\"stylesheet\" href=\"a.css.pagespeed.tw.0.css\">\n",
            "<link rel=\"stylesheet\" href=\"a.css.pagespeed.tw.0.css\">"
        )
    );
    assert_eq!(fixture.engine.statistics().rewrites_executed(), 1);
    assert_eq!(fixture.counting.fetch_count(), 1);
}

#[test(tokio::test)]
async fn combines_stylesheets() {
    let fixture = Fixture::new(options(&["cc"]));
    fixture.css("http://test.com/a.css", "a{}");
    fixture.css("http://test.com/b.css", "b{}");

    let html = fixture
        .rewrite("<link rel=stylesheet href=a.css><link rel=stylesheet href=b.css>")
        .await;
    assert_eq!(
        html,
        r#"<link rel="stylesheet" href="a.css+b.css.pagespeed.cc.0.css">"#
    );
    assert_eq!(
        fixture
            .cached_body("http://test.com/a.css+b.css.pagespeed.cc.0.css")
            .await
            .unwrap(),
        "a{}\nb{}"
    );
}

#[test(tokio::test)]
async fn too_busy_is_not_recorded() {
    let minifier = Arc::new(SingleRewriteFilter::new(JsMinifier::new(4)));
    let filter = minifier.clone();
    let fixture = Fixture::custom(options(&["jm"]), move |builder| builder.filter(filter));
    fixture
        .fetcher
        .set_text("http://test.com/x.js", "application/javascript", "  x();\n", 100);

    let html = fixture.rewrite("<script src=x.js></script>").await;
    assert_eq!(html, "<script src=x.js></script>");
    assert_eq!(fixture.engine.statistics().too_busy(), 1);

    minifier.rewriter().set_max_bytes(1000);
    let html = fixture.rewrite("<script src=x.js></script>").await;
    assert_eq!(html, r#"<script src="x.js.pagespeed.jm.0.js"></script>"#);

    let stats = fixture.engine.statistics();
    assert_eq!(stats.metadata_misses(), 2);
    assert_eq!(stats.metadata_hits(), 0);
    assert_eq!(fixture.counting.fetch_count(), 1);
}

#[test(tokio::test)]
async fn chained_filters() {
    let fixture = Fixture::new(options(&["tw", "uc"]));
    fixture.css("http://test.com/a.css", "  a  ");

    let html = fixture.rewrite("<link rel=stylesheet href=a.css>").await;
    assert_eq!(
        html,
        r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css.pagespeed.uc.0.css">"#
    );
    assert_eq!(
        fixture
            .cached_body("http://test.com/a.css.pagespeed.tw.0.css.pagespeed.uc.0.css")
            .await
            .unwrap(),
        "A"
    );

    // A fresh engine reconstructs the intermediate resource on its own
    let fixture = Fixture::new(options(&["tw", "uc"]));
    fixture.css("http://test.com/a.css", "  a  ");
    let served = fixture
        .engine
        .fetch_resource(
            "http://test.com/a.css.pagespeed.tw.0.css.pagespeed.uc.0.css",
            &HeaderMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body, "A");
}

#[test(tokio::test)]
async fn nested_rewrites() {
    let fixture = Fixture::new(options(&["cf"]));
    fixture.css("http://test.com/style.css", "a{background:url(a.png)}");
    fixture
        .fetcher
        .set_text("http://test.com/a.png", "image/png", "png", 100);

    let html = fixture.rewrite("<link rel=stylesheet href=style.css>").await;
    assert_eq!(
        html,
        r#"<link rel="stylesheet" href="style.css.pagespeed.cf.0.css">"#
    );
    assert_eq!(
        fixture
            .cached_body("http://test.com/style.css.pagespeed.cf.0.css")
            .await
            .unwrap(),
        "a{background:url(a.png.pagespeed.ce.0.png)}"
    );

    // The cache extender doesn't store its outputs, they are reproduced on request
    let served = fixture
        .engine
        .fetch_resource("http://test.com/a.png.pagespeed.ce.0.png", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body, "png");
    assert_eq!(served.header(header::CONTENT_TYPE), Some("image/png"));

    let html = fixture.rewrite("<link rel=stylesheet href=style.css>").await;
    assert_eq!(
        html,
        r#"<link rel="stylesheet" href="style.css.pagespeed.cf.0.css">"#
    );
    assert_eq!(fixture.counting.fetch_count(), 2);
}

#[test(tokio::test)]
async fn base_element() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://cdn.test.com/css/a.css", "  a  ");

    let html = fixture
        .rewrite(r#"<base href="http://cdn.test.com/css/"><link rel=stylesheet href=a.css>"#)
        .await;
    assert_eq!(
        html,
        concat!(
            r#"<base href="http://cdn.test.com/css/">"#,
            r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#
        )
    );
}

#[test(tokio::test)]
async fn revalidation() {
    let fixture = Fixture::custom(options(&["tw"]), |builder| {
        builder
            .with_default_filters()
            .hasher(Arc::new(Sha256Hasher::new(10)))
    });
    let hasher = Sha256Hasher::new(10);
    fixture.css("http://test.com/a.css", "  a  ");
    let expected = format!(
        r#"<link rel="stylesheet" href="a.css.pagespeed.tw.{}.css">"#,
        hasher.hash(b"a")
    );

    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );

    // Expired but unchanged input keeps the result
    fixture.timer.advance_ms(200_000);
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );
    let stats = fixture.engine.statistics();
    assert_eq!(stats.metadata_revalidations(), 1);
    assert_eq!(stats.rewrites_executed(), 1);
    assert_eq!(fixture.counting.fetch_count(), 2);

    // Changed input produces a new result
    fixture.css("http://test.com/a.css", "  b  ");
    fixture.timer.advance_ms(200_000);
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        format!(
            r#"<link rel="stylesheet" href="a.css.pagespeed.tw.{}.css">"#,
            hasher.hash(b"b")
        )
    );
    assert_eq!(stats.rewrites_executed(), 2);
    assert_eq!(fixture.counting.fetch_count(), 3);
}

#[test(tokio::test)]
async fn corrupt_metadata_is_replaced() {
    let metadata = Arc::new(LruCache::new(1024 * 1024, Arc::new(MockTimer::default())));
    let cache = metadata.clone();
    let fixture = Fixture::custom(options(&["tw"]), move |builder| {
        builder.with_default_filters().metadata_cache(cache)
    });
    fixture.css("http://test.com/a.css", "  a  ");
    let expected = r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#;

    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );
    let keys = metadata.keys();
    assert_eq!(keys.len(), 1);
    metadata
        .put(&keys[0], Bytes::from_static(b"garbage"), None)
        .await;

    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );
    let stats = fixture.engine.statistics();
    assert_eq!(stats.metadata_misses(), 2);
    assert_eq!(stats.metadata_hits(), 1);
    assert_eq!(stats.rewrites_executed(), 2);
}

#[test(tokio::test)]
async fn unavailable_input_is_retried_later() {
    let fixture = Fixture::new(options(&["tw"]));

    for _ in 0..2 {
        assert_eq!(
            fixture.rewrite("<link rel=stylesheet href=a.css>").await,
            "<link rel=stylesheet href=a.css>"
        );
    }
    assert_eq!(fixture.counting.fetch_count(), 1);
    assert_eq!(fixture.engine.statistics().metadata_hits(), 1);

    fixture.css("http://test.com/a.css", "  a  ");
    fixture.timer.advance_ms(400_000);
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#
    );
    assert_eq!(fixture.counting.fetch_count(), 2);
}

#[test(tokio::test)]
async fn uncacheable_inputs() {
    let fixture = Fixture::new(RewriteOptions {
        rewrite_uncacheable: true,
        ..options(&["tw"])
    });
    fixture
        .fetcher
        .set_text("http://test.com/a.css", "text/css", "  a  ", 0);

    for _ in 0..2 {
        assert_eq!(
            fixture.rewrite("<link rel=stylesheet href=a.css>").await,
            r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#
        );
    }
    let stats = fixture.engine.statistics();
    assert_eq!(stats.metadata_misses(), 2);
    assert_eq!(stats.rewrites_executed(), 2);
}

#[test(tokio::test(start_paused = true))]
async fn deadline_exceeded() {
    let timer = Arc::new(MockTimer::default());
    let fetcher = Arc::new(MockUrlFetcher::new());
    let wait = Arc::new(WaitUrlFetcher::new(fetcher.clone()));
    let engine = Engine::builder(RewriteOptions {
        render_deadline_ms: 10,
        ..options(&["tw"])
    })
    .timer(timer)
    .hasher(Arc::new(MockHasher::default()))
    .fetcher(wait.clone())
    .with_default_filters()
    .build()
    .unwrap();
    fetcher.set_text("http://test.com/a.css", "text/css", "  a  ", 100);

    wait.hold();
    let mut driver = engine.new_driver(DOCUMENT, &HeaderMap::new()).unwrap();
    driver.parse("<link rel=stylesheet href=a.css>");
    assert_eq!(driver.finish().await, "<link rel=stylesheet href=a.css>");
    assert_eq!(wait.waiting(), 1);
    assert_eq!(engine.statistics().deadline_exceeded(), 1);

    // The rewrite completes in the background and benefits the next request
    wait.pass_through();
    engine.wait_for_background().await;

    let mut driver = engine.new_driver(DOCUMENT, &HeaderMap::new()).unwrap();
    driver.parse("<link rel=stylesheet href=a.css>");
    assert_eq!(
        driver.finish().await,
        r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#
    );
    assert_eq!(engine.statistics().metadata_hits(), 1);
    assert_eq!(engine.statistics().rewrites_executed(), 1);
}

#[test(tokio::test)]
async fn shutdown_stops_rewriting() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "  a  ");
    fixture.engine.shutdown();
    assert!(fixture.engine.is_shutting_down());

    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        "<link rel=stylesheet href=a.css>"
    );
    assert_eq!(fixture.counting.fetch_count(), 0);
    assert_eq!(fixture.engine.statistics().rewrites_executed(), 0);
}

#[test(tokio::test)]
async fn reconstruction_from_cache() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "  a  ");
    fixture.rewrite("<link rel=stylesheet href=a.css>").await;

    let served = fixture
        .engine
        .fetch_resource("http://test.com/a.css.pagespeed.tw.0.css", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body, "a");
    assert_eq!(served.header(header::ETAG), Some(r#"W/"tw-0""#));
    assert_eq!(served.header(header::CACHE_CONTROL), Some("max-age=31536000"));
    assert_eq!(served.header(header::CONTENT_TYPE), Some("text/css"));

    let mut request_headers = HeaderMap::new();
    request_headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static(r#"W/"tw-0""#));
    let served = fixture
        .engine
        .fetch_resource("http://test.com/a.css.pagespeed.tw.0.css", &request_headers)
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::NOT_MODIFIED);
    assert!(served.body.is_empty());
    assert_eq!(fixture.counting.fetch_count(), 1);
}

#[test(tokio::test)]
async fn reconstruction_from_scratch() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "  a  ");

    let served = fixture
        .engine
        .fetch_resource("http://test.com/a.css.pagespeed.tw.0.css", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body, "a");
    assert_eq!(served.header("x-original-content-length"), Some("5"));

    // The HTML path now finds the result
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#
    );
    assert_eq!(fixture.engine.statistics().rewrites_executed(), 1);
}

#[test(tokio::test)]
async fn outdated_hash_is_redirected() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "  a  ");
    fixture.rewrite("<link rel=stylesheet href=a.css>").await;

    let served = fixture
        .engine
        .fetch_resource("http://test.com/a.css.pagespeed.tw.1.css", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::FOUND);
    assert_eq!(
        served.header(header::LOCATION),
        Some("http://test.com/a.css.pagespeed.tw.0.css")
    );
    assert_eq!(served.header(header::CACHE_CONTROL), Some("max-age=300,private"));
}

#[test(tokio::test)]
async fn fallback_to_input() {
    let fixture = Fixture::new(options(&["tw"]));
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/css"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=100"));
    headers.insert(header::SET_COOKIE, HeaderValue::from_static("session=1"));
    fixture.fetcher.set_response(
        "http://test.com/b.css",
        FetchResponse::new(StatusCode::OK, headers, "b"),
    );

    let served = fixture
        .engine
        .fetch_resource("http://test.com/b.css.pagespeed.tw.0.css", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body, "b");
    assert_eq!(served.header(header::CACHE_CONTROL), Some("max-age=300,private"));
    assert_eq!(served.header(header::SET_COOKIE), None);
    assert_eq!(fixture.engine.statistics().fallbacks_served(), 1);
}

#[test(tokio::test)]
async fn combined_output_has_no_fallback() {
    let fixture = Fixture::new(options(&["cc"]));
    fixture.css("http://test.com/a.css", "a{}");

    let err = fixture
        .engine
        .fetch_resource(
            "http://test.com/a.css+missing.css.pagespeed.cc.0.css",
            &HeaderMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.etype(), &ErrorType::HTTPStatus(404));
    assert_eq!(fixture.engine.statistics().fallbacks_served(), 0);
}

#[test(tokio::test)]
async fn malformed_urls() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "  a  ");

    for url in [
        "http://test.com/a.css",
        "http://test.com/a.css.pagespeed.tw.0.css?x",
        "http://test.com/a%2ecss.pagespeed.tw.0.css",
        "http://test.com/a.css.pagespeed.xx.0.css",
        "http://test.com/.pagespeed.tw.0.css",
        "not a URL",
    ] {
        let err = fixture
            .engine
            .fetch_resource(url, &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.etype(), &ErrorType::HTTPStatus(404), "{url}");
    }
    assert_eq!(fixture.counting.fetch_count(), 0);
}

#[test(tokio::test)]
async fn in_place_optimization() {
    let fixture = Fixture::new(options(&[]));
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/css"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=100"));
    headers.insert(header::SET_COOKIE, HeaderValue::from_static("session=1"));
    fixture.fetcher.set_response(
        "http://test.com/a.css",
        FetchResponse::new(StatusCode::OK, headers, "  a  "),
    );

    let served = fixture
        .engine
        .fetch_in_place("http://test.com/a.css")
        .await
        .unwrap();
    assert_eq!(served.body, "  a  ");
    assert_eq!(served.header(header::CACHE_CONTROL), Some("max-age=300,private"));
    assert_eq!(served.header(header::SET_COOKIE), None);

    fixture.engine.wait_for_background().await;

    let served = fixture
        .engine
        .fetch_in_place("http://test.com/a.css")
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body, "a");
    assert_eq!(served.header(header::CACHE_CONTROL), Some("max-age=100"));
    assert_eq!(served.header(header::CONTENT_TYPE), Some("text/css"));
    assert_eq!(fixture.counting.fetch_count(), 1);

    let err = fixture
        .engine
        .fetch_in_place("http://test.com/missing.css")
        .await
        .unwrap_err();
    assert_eq!(err.etype(), &ErrorType::HTTPStatus(404));
}

/// Trims stylesheets, taking so long that the input expires in the meantime
#[derive(Debug)]
struct SlowTrim {
    timer: Arc<MockTimer>,
}

impl SingleRewrite for SlowTrim {
    fn id(&self) -> &'static str {
        "sl"
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
        self.timer.advance_ms(200_000);
        RewriteResult::Ok(OutputContent::new(
            input.text().trim().to_owned(),
            ContentType::css(),
        ))
    }
}

#[test(tokio::test)]
async fn expired_input_is_not_recorded() {
    let metadata = Arc::new(LruCache::new(1024 * 1024, Arc::new(MockTimer::default())));
    let cache = metadata.clone();
    let fixture = Fixture::with_timer(options(&["sl"]), move |builder, timer| {
        builder
            .filter(Arc::new(SingleRewriteFilter::new(SlowTrim {
                timer: timer.clone(),
            })))
            .metadata_cache(cache)
    });
    fixture.css("http://test.com/a.css", "  a  ");

    for _ in 0..2 {
        assert_eq!(
            fixture.rewrite("<link rel=stylesheet href=a.css>").await,
            r#"<link rel="stylesheet" href="a.css.pagespeed.sl.0.css">"#
        );
        assert!(metadata.keys().is_empty());
    }
    let stats = fixture.engine.statistics();
    assert_eq!(stats.metadata_misses(), 2);
    assert_eq!(stats.metadata_hits(), 0);
    assert_eq!(stats.rewrites_executed(), 2);
}

/// Rewrites nothing, but records the contexts that weren't rendered in time
#[derive(Debug, Default)]
struct RenderWatcher {
    missed: Mutex<Vec<String>>,
}

impl RewriteFilter for RenderWatcher {
    fn id(&self) -> &'static str {
        "rw"
    }

    fn rewrite(&self, _job: &RewriteJob) -> RewriteStep {
        RewriteStep::Done(RewriteResult::Failed)
    }

    fn html_filter(self: Arc<Self>) -> Option<Box<dyn HtmlFilter>> {
        Some(Box::new(RenderWatcherHtml { filter: self }))
    }
}

struct RenderWatcherHtml {
    filter: Arc<RenderWatcher>,
}

impl HtmlFilter for RenderWatcherHtml {
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

    fn will_not_render(&mut self, scope: &mut HtmlScope<'_>, context: ContextId) {
        let urls = scope
            .context_slots(context)
            .iter()
            .map(|slot| scope.slot_url(*slot).to_owned());
        self.filter.missed.lock().unwrap().extend(urls);
    }
}

#[test(tokio::test(start_paused = true))]
async fn missed_deadline_is_reported_once() {
    let watcher = Arc::new(RenderWatcher::default());
    let filter = watcher.clone();
    let fetcher = Arc::new(MockUrlFetcher::new());
    let wait = Arc::new(WaitUrlFetcher::new(fetcher.clone()));
    let origin = wait.clone();
    let fixture = Fixture::custom(
        RewriteOptions {
            render_deadline_ms: 10,
            ..options(&["rw"])
        },
        move |builder| builder.filter(filter).fetcher(origin),
    );
    fetcher.set_text("http://test.com/a.css", "text/css", "a", 100);

    wait.hold();
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        "<link rel=stylesheet href=a.css>"
    );
    assert_eq!(
        *watcher.missed.lock().unwrap(),
        ["http://test.com/a.css".to_owned()]
    );
    assert_eq!(fixture.engine.statistics().deadline_exceeded(), 1);

    wait.pass_through();
    fixture.engine.wait_for_background().await;
    assert_eq!(watcher.missed.lock().unwrap().len(), 1);

    // Rewrites completing in time aren't reported
    fixture.rewrite("<link rel=stylesheet href=a.css>").await;
    assert_eq!(watcher.missed.lock().unwrap().len(), 1);
}

/// Fails fetches of one URL as too busy while `busy` is set
#[derive(Debug)]
struct BusyFetcher {
    inner: Arc<MockUrlFetcher>,
    url: &'static str,
    busy: AtomicBool,
}

#[async_trait]
impl UrlAsyncFetcher for BusyFetcher {
    async fn fetch(
        &self,
        url: &str,
        request_headers: &HeaderMap,
    ) -> Result<FetchResponse, Box<Error>> {
        if url == self.url && self.busy.load(Ordering::SeqCst) {
            return Err(Error::explain(TOO_BUSY, "fetcher is busy"));
        }
        self.inner.fetch(url, request_headers).await
    }
}

#[test(tokio::test)]
async fn busy_nested_rewrite_is_not_recorded() {
    let mock = Arc::new(MockUrlFetcher::new());
    let busy = Arc::new(BusyFetcher {
        inner: mock.clone(),
        url: "http://test.com/a.png",
        busy: AtomicBool::new(true),
    });
    let origin = busy.clone();
    let fixture = Fixture::custom(options(&["cf"]), move |builder| {
        builder.with_default_filters().fetcher(origin)
    });
    mock.set_text("http://test.com/style.css", "text/css", "a{background:url(a.png)}", 100);
    mock.set_text("http://test.com/a.png", "image/png", "png", 100);

    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=style.css>").await,
        "<link rel=stylesheet href=style.css>"
    );
    assert_eq!(fixture.engine.statistics().metadata_misses(), 2);

    busy.busy.store(false, Ordering::SeqCst);
    let expected = r#"<link rel="stylesheet" href="style.css.pagespeed.cf.0.css">"#;
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=style.css>").await,
        expected
    );
    assert_eq!(fixture.engine.statistics().metadata_misses(), 4);
    assert_eq!(fixture.engine.statistics().metadata_hits(), 0);
    assert_eq!(
        fixture
            .cached_body("http://test.com/style.css.pagespeed.cf.0.css")
            .await
            .unwrap(),
        "a{background:url(a.png.pagespeed.ce.0.png)}"
    );

    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=style.css>").await,
        expected
    );
    assert_eq!(fixture.engine.statistics().metadata_hits(), 1);
}

#[test(tokio::test)]
async fn inputs_close_to_expiry_are_freshened() {
    let fixture = Fixture::new(options(&["tw"]));
    fixture.css("http://test.com/a.css", "  a  ");
    let expected = r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#;
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );

    // Within the freshening margin: the result is used while the input is refetched
    fixture.timer.advance_ms(70_000);
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );
    fixture.engine.wait_for_background().await;
    let stats = fixture.engine.statistics();
    assert_eq!(stats.freshens(), 1);
    assert_eq!(fixture.counting.fetch_count(), 2);

    // Past the original expiration the freshened record is still valid
    fixture.timer.advance_ms(60_000);
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );
    fixture.engine.wait_for_background().await;
    assert_eq!(stats.metadata_hits(), 2);
    assert_eq!(stats.metadata_revalidations(), 0);
    assert_eq!(stats.rewrites_executed(), 1);
}

#[test(tokio::test)]
async fn freshening_yields_to_concurrent_writes() {
    let mock = Arc::new(MockUrlFetcher::new());
    let wait = Arc::new(WaitUrlFetcher::new(mock.clone()));
    let metadata = Arc::new(LruCache::new(1024 * 1024, Arc::new(MockTimer::default())));
    let (origin, cache) = (wait.clone(), metadata.clone());
    let fixture = Fixture::custom(options(&["tw"]), move |builder| {
        builder
            .with_default_filters()
            .fetcher(origin)
            .metadata_cache(cache)
    });
    mock.set_text("http://test.com/a.css", "text/css", "  a  ", 100);
    let expected = r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#;
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );
    let key = metadata.keys().remove(0);

    wait.hold();
    fixture.timer.advance_ms(70_000);
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        expected
    );
    while wait.waiting() == 0 {
        tokio::task::yield_now().await;
    }

    // Another writer replaces the record while the input is being refetched
    let mut record =
        OutputPartitions::decode(&metadata.get(&key).await.unwrap(), 1).unwrap();
    let original_expiration = record.partitions[0].input_info[0].expiration_ms;
    record.generation += 1;
    metadata.put(&key, record.encode().unwrap(), None).await;

    wait.pass_through();
    fixture.engine.wait_for_background().await;
    assert_eq!(fixture.engine.statistics().freshens(), 0);
    let stored = OutputPartitions::decode(&metadata.get(&key).await.unwrap(), 1).unwrap();
    assert_eq!(stored, record);
    assert_eq!(
        stored.partitions[0].input_info[0].expiration_ms,
        original_expiration
    );
}

/// Keeps any further filters from processing stylesheet references
#[derive(Debug)]
struct StopProcessing;

impl RewriteFilter for StopProcessing {
    fn id(&self) -> &'static str {
        "sp"
    }

    fn rewrite(&self, _job: &RewriteJob) -> RewriteStep {
        RewriteStep::Done(RewriteResult::Failed)
    }

    fn html_filter(self: Arc<Self>) -> Option<Box<dyn HtmlFilter>> {
        Some(Box::new(StopProcessingHtml))
    }
}

struct StopProcessingHtml;

impl HtmlFilter for StopProcessingHtml {
    fn start_element(&mut self, scope: &mut HtmlScope<'_>, element: ElementId) {
        if let Some(slot) = scope.html_slot(element, HtmlTarget::STYLESHEET.attribute) {
            scope.slot_flags_mut(slot).disable_further_processing = true;
        }
    }
}

#[test(tokio::test)]
async fn disabled_slot_cancels_successors() {
    let fixture = Fixture::custom(options(&["tw", "sp", "uc"]), |builder| {
        builder
            .with_default_filters()
            .filter(Arc::new(StopProcessing))
    });
    fixture.css("http://test.com/a.css", "  a  ");

    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#
    );
    let stats = fixture.engine.statistics();
    assert_eq!(stats.rewrites_executed(), 1);
    assert_eq!(stats.metadata_misses(), 1);
}

#[test(tokio::test)]
async fn concurrent_reconstructions_share_the_rewrite() {
    let mock = Arc::new(MockUrlFetcher::new());
    let wait = Arc::new(WaitUrlFetcher::new(mock.clone()));
    let origin = wait.clone();
    let fixture = Fixture::custom(
        RewriteOptions {
            lock_wait_ms: 60_000,
            ..options(&["tw"])
        },
        move |builder| builder.with_default_filters().fetcher(origin),
    );
    mock.set_text("http://test.com/a.css", "text/css", "  a  ", 100);
    let url = "http://test.com/a.css.pagespeed.tw.0.css";

    wait.hold();
    let spawn = || {
        let engine = fixture.engine.clone();
        tokio::spawn(async move { engine.fetch_resource(url, &HeaderMap::new()).await })
    };
    let first = spawn();
    while wait.waiting() == 0 {
        tokio::task::yield_now().await;
    }

    // The second request waits for the lock held by the first one
    let second = spawn();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(wait.waiting(), 1);
    assert!(!second.is_finished());

    wait.pass_through();
    for task in [first, second] {
        let served = task.await.unwrap().unwrap();
        assert_eq!(served.status, StatusCode::OK);
        assert_eq!(served.body, "a");
    }
    let stats = fixture.engine.statistics();
    assert_eq!(stats.rewrites_executed(), 1);
    assert_eq!(stats.metadata_hits(), 1);
}

#[test(tokio::test)]
async fn contended_document_rewrite_gives_up() {
    let mock = Arc::new(MockUrlFetcher::new());
    let wait = Arc::new(WaitUrlFetcher::new(mock.clone()));
    let origin = wait.clone();
    let fixture = Fixture::custom(
        RewriteOptions {
            lock_wait_ms: 10,
            ..options(&["tw"])
        },
        move |builder| builder.with_default_filters().fetcher(origin),
    );
    mock.set_text("http://test.com/a.css", "text/css", "  a  ", 100);

    wait.hold();
    let engine = fixture.engine.clone();
    let first = tokio::spawn(async move {
        let mut driver = engine.new_driver(DOCUMENT, &HeaderMap::new()).unwrap();
        driver.parse("<link rel=stylesheet href=a.css>");
        driver.finish().await
    });
    while wait.waiting() == 0 {
        tokio::task::yield_now().await;
    }

    // The lock is held by the first document, the second one doesn't duplicate the work
    assert_eq!(
        fixture.rewrite("<link rel=stylesheet href=a.css>").await,
        "<link rel=stylesheet href=a.css>"
    );
    assert_eq!(wait.waiting(), 1);

    wait.pass_through();
    assert_eq!(
        first.await.unwrap(),
        r#"<link rel="stylesheet" href="a.css.pagespeed.tw.0.css">"#
    );
    let stats = fixture.engine.statistics();
    assert_eq!(stats.rewrites_executed(), 1);
    assert_eq!(stats.too_busy(), 0);
}

/// Uppercases stylesheets, waiting for the runtime before deciding on partitions
#[derive(Debug, Default)]
struct DeferredPartitioning {
    partitioned: AtomicBool,
}

impl RewriteFilter for DeferredPartitioning {
    fn id(&self) -> &'static str {
        "dp"
    }

    fn partition(
        &self,
        _inputs: &[Resource],
        _options: &RewriteOptions,
    ) -> Option<Vec<PartitionPlan>> {
        None
    }

    fn partition_async(
        &self,
        inputs: &[Resource],
        _options: &Arc<RewriteOptions>,
    ) -> Option<PartitionFuture> {
        self.partitioned.store(true, Ordering::SeqCst);
        let loaded = inputs.iter().all(Resource::is_loaded);
        Some(Box::pin(async move {
            tokio::task::yield_now().await;
            loaded.then(|| vec![PartitionPlan::new(vec![0])])
        }))
    }

    fn rewrite(&self, job: &RewriteJob) -> RewriteStep {
        RewriteStep::Done(RewriteResult::Ok(OutputContent::new(
            job.inputs[0].text().to_uppercase(),
            ContentType::css(),
        )))
    }
}

#[test(tokio::test)]
async fn asynchronous_partitioning() {
    let deferred = Arc::new(DeferredPartitioning::default());
    let filter = deferred.clone();
    let fixture = Fixture::custom(options(&["dp"]), move |builder| builder.filter(filter));
    fixture.css("http://test.com/a.css", "a");

    let served = fixture
        .engine
        .fetch_resource("http://test.com/a.css.pagespeed.dp.0.css", &HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body, "A");
    assert!(deferred.partitioned.load(Ordering::SeqCst));
    assert_eq!(fixture.engine.statistics().rewrites_executed(), 1);
}
