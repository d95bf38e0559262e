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

use crate::configuration::PagespeedConf;
use crate::handler::{PagespeedHandler, Reply};

use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use pagespeed_engine::hasher::MockHasher;
use pagespeed_utils::pingora::{RequestHeader, Session};
use pagespeed_utils::standard_response::response_text;
use pagespeed_utils::{FromYaml, RequestFilter, RequestFilterResult};
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use test_log::test;

fn root_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("testdata");
    path.push("root");
    if !filename.is_empty() {
        path.push(filename);
    }
    path
}

fn default_conf() -> String {
    format!(
        "root: {}\nrender_deadline_ms: 60000",
        root_path("").into_os_string().into_string().unwrap()
    )
}

fn extended_conf(conf_str: impl AsRef<str>) -> String {
    format!("{}\n{}", default_conf(), conf_str.as_ref())
}

fn make_handler(conf_str: impl AsRef<str>) -> PagespeedHandler {
    PagespeedHandler::with_builder(PagespeedConf::from_yaml(conf_str).unwrap(), |builder| {
        builder.hasher(Arc::new(MockHasher::default()))
    })
    .unwrap()
}

async fn get(handler: &PagespeedHandler, path: &str) -> Reply {
    request(handler, Method::GET, path, HeaderMap::new()).await
}

async fn request(
    handler: &PagespeedHandler,
    method: Method,
    path: &str,
    headers: HeaderMap,
) -> Reply {
    handler
        .respond(&method, &path.parse::<Uri>().unwrap(), &headers)
        .await
        .unwrap()
}

fn assert_standard(reply: &Reply, status: StatusCode) {
    assert_eq!(reply.status, status);
    assert_eq!(reply.body, response_text(status));
    assert_eq!(
        reply.header(header::CONTENT_TYPE),
        Some("text/html;charset=utf-8")
    );
}

async fn make_session(method: &str, path: &str) -> Session {
    let header = RequestHeader::build(method, path.as_bytes(), None).unwrap();

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let _ = cursor.write(b"GET / HTTP/1.1\r\n");
    let _ = cursor.write(b"Connection: close\r\n");
    let _ = cursor.write(b"\r\n");
    let _ = cursor.seek(SeekFrom::Start(0));

    let mut session = Session::new_h1(Box::new(cursor));
    assert!(session.read_request().await.unwrap());
    *session.req_header_mut() = header;
    session
}

#[test]
fn unconfigured() {
    let err = PagespeedHandler::new(PagespeedConf::default()).unwrap_err();
    assert!(err.to_string().contains("No root path configured"));

    let conf = PagespeedConf::from_yaml("root: /nonexistent/pagespeed/root").unwrap();
    assert!(PagespeedHandler::new(conf).is_err());

    let conf = PagespeedConf::from_yaml(extended_conf("enabled_filters: [xx]")).unwrap();
    assert!(PagespeedHandler::new(conf).is_err());
}

#[test(tokio::test)]
async fn document_without_filters() {
    let handler = make_handler(default_conf());

    let reply = get(&handler, "/").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(
        reply.body,
        std::fs::read_to_string(root_path("index.html")).unwrap()
    );
    assert_eq!(
        reply.header(header::CONTENT_TYPE),
        Some("text/html;charset=utf-8")
    );
    assert_eq!(
        reply.header(header::CACHE_CONTROL),
        Some("max-age=0, no-cache")
    );
}

#[test(tokio::test)]
async fn document_rewritten() {
    let handler = make_handler(extended_conf("enabled_filters: [tw, jm]"));

    let reply = get(&handler, "/index.html").await;
    assert_eq!(reply.status, StatusCode::OK);
    let html = String::from_utf8(reply.body.to_vec()).unwrap();
    assert!(
        html.contains(r#"<link rel="stylesheet" href="css/style.css.pagespeed.tw.0.css">"#),
        "{html}"
    );
    assert!(
        html.contains(r#"<script src="js/app.js.pagespeed.jm.0.js"></script>"#),
        "{html}"
    );
    assert!(html.contains("<body>Hello</body>"), "{html}");

    let reply = get(&handler, "/css/style.css.pagespeed.tw.0.css").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "body { color: red; }");
    assert_eq!(reply.header(header::CACHE_CONTROL), Some("max-age=31536000"));
    assert_eq!(reply.header(header::ETAG), Some(r#"W/"tw-0""#));

    let reply = get(&handler, "/js/app.js.pagespeed.jm.0.js").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "function greet() {\nalert(\"hi\");\n}");
}

#[test(tokio::test)]
async fn rewritten_resource_not_modified() {
    let handler = make_handler(extended_conf("enabled_filters: [tw]"));
    get(&handler, "/").await;

    let mut headers = HeaderMap::new();
    headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static(r#"W/"tw-0""#));
    let reply = request(
        &handler,
        Method::GET,
        "/css/style.css.pagespeed.tw.0.css",
        headers,
    )
    .await;
    assert_eq!(reply.status, StatusCode::NOT_MODIFIED);
    assert!(reply.body.is_empty());
}

#[test(tokio::test)]
async fn rewritten_resource_reconstructed() {
    let handler = make_handler(extended_conf("enabled_filters: [tw]"));

    let reply = get(&handler, "/css/style.css.pagespeed.tw.0.css").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "body { color: red; }");
    assert_eq!(reply.header("x-original-content-length"), Some("27"));
}

#[test(tokio::test)]
async fn invalid_rewritten_resources() {
    let handler = make_handler(extended_conf("enabled_filters: [tw]"));

    for path in [
        "/css/style.css.pagespeed.xx.0.css",
        "/css/missing.css.pagespeed.cc.0.css",
        "/css/.pagespeed.tw.0.css",
    ] {
        assert_standard(&get(&handler, path).await, StatusCode::NOT_FOUND);
    }
}

#[test(tokio::test)]
async fn static_files() {
    let handler = make_handler(default_conf());

    let reply = get(&handler, "/css/style.css").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "   body { color: red; }   \n");
    assert_eq!(
        reply.header(header::CONTENT_TYPE),
        Some("text/css;charset=utf-8")
    );

    let reply = get(&handler, "/file%2etxt").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "Just text\n");

    assert_standard(&get(&handler, "/missing.txt").await, StatusCode::NOT_FOUND);
    assert_standard(&get(&handler, "/css/").await, StatusCode::NOT_FOUND);
}

#[test(tokio::test)]
async fn in_place() {
    let handler = make_handler(extended_conf("in_place_rewriting: true"));

    let reply = get(&handler, "/css/style.css").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "   body { color: red; }   \n");
    assert_eq!(
        reply.header(header::CACHE_CONTROL),
        Some("max-age=300,private")
    );

    handler.engine().wait_for_background().await;

    let reply = get(&handler, "/css/style.css").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "body { color: red; }");

    assert_standard(&get(&handler, "/missing.css").await, StatusCode::NOT_FOUND);
}

#[test(tokio::test)]
async fn rejected_requests() {
    let handler = make_handler(default_conf());

    let reply = request(&handler, Method::POST, "/index.html", HeaderMap::new()).await;
    assert_standard(&reply, StatusCode::METHOD_NOT_ALLOWED);

    assert_standard(&get(&handler, "/../Cargo.toml").await, StatusCode::BAD_REQUEST);
    assert_standard(
        &get(&handler, "/css/%2e%2e/%2e%2e/Cargo.toml").await,
        StatusCode::BAD_REQUEST,
    );
}

#[test(tokio::test)]
async fn session_response() {
    let handler = make_handler(extended_conf("enabled_filters: [tw]"));

    let mut session = make_session("GET", "/css/style.css.pagespeed.tw.0.css").await;
    assert_eq!(
        handler.request_filter(&mut session, &mut ()).await.unwrap(),
        RequestFilterResult::ResponseSent
    );
    let response = session.response_written().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok()),
        Some("20")
    );

    let mut session = make_session("HEAD", "/missing.txt").await;
    assert!(handler.handle(&mut session, &mut ()).await.unwrap());
    assert_eq!(
        session.response_written().unwrap().status,
        StatusCode::NOT_FOUND
    );
}
