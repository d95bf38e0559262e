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

//! Handler for the `request_filter` phase.

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use log::{debug, info, warn};
use pagespeed_engine::fetch::FileLoadMapping;
use pagespeed_engine::{Engine, EngineBuilder, ServedResource};
use pagespeed_utils::pingora::{Error, ErrorType, ResponseHeader, Session};
use pagespeed_utils::standard_response::response_text;
use pagespeed_utils::{RequestFilter, RequestFilterResult};
use percent_encoding::percent_decode_str;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use url::Url;

use crate::configuration::PagespeedConf;

const DEFAULT_BASE_URL: &str = "http://localhost:8080/";
const INDEX_FILE: &str = "index.html";

/// A response produced by [`PagespeedHandler::respond`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Response status
    pub status: StatusCode,
    /// Response headers, `Content-Length` excluded
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl Reply {
    fn new(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// A standard page for the status code
    fn standard(status: StatusCode) -> Self {
        Self::new(status, "text/html;charset=utf-8", response_text(status))
    }

    /// Value of a response header if it is valid UTF-8
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

impl From<ServedResource> for Reply {
    fn from(served: ServedResource) -> Self {
        Self {
            status: served.status,
            headers: served.headers,
            body: served.body,
        }
    }
}

/// Handler for Pingora’s `request_filter` phase
#[derive(Debug)]
pub struct PagespeedHandler {
    conf: PagespeedConf,
    root: PathBuf,
    base_url: Url,
    engine: Engine,
}

impl PagespeedHandler {
    /// Creates a new handler, letting `customize` replace engine collaborators before the
    /// engine is built. [`RequestFilter::new`] creates a handler with the default collaborators.
    pub fn with_builder(
        conf: PagespeedConf,
        customize: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Result<Self, Box<Error>> {
        let root = conf
            .root
            .as_ref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "No root path configured"))?
            .canonicalize()
            .map_err(|err| {
                Error::because(
                    ErrorType::InternalError,
                    format!("Failed accessing root path {:?}", conf.root),
                    err,
                )
            })?;

        let base_url = conf.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let mut base_url = Url::parse(base_url).map_err(|err| {
            Error::because(
                ErrorType::InternalError,
                format!("Invalid base URL {base_url}"),
                err,
            )
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut options = conf.rewrite.clone();
        if options.file_load.is_empty() {
            options.file_load.push(FileLoadMapping {
                url_prefix: base_url.to_string(),
                directory: root.clone(),
            });
        }
        let engine = customize(Engine::builder(options).with_default_filters()).build()?;

        debug!("Initialized pagespeed handler, settings: {conf:#?}");
        Ok(Self {
            conf,
            root,
            base_url,
            engine,
        })
    }

    /// Provides read-only access to the handler’s configuration.
    pub fn conf(&self) -> &PagespeedConf {
        &self.conf
    }

    /// The rewrite engine used by this handler
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Produces the response to a request:
    ///
    /// * Rewritten resources (`.pagespeed.` URLs) are served by the engine.
    /// * HTML documents from the root directory are rewritten with the enabled filters.
    /// * Other files are served optimized in place if `in_place_rewriting` is enabled, as they
    ///   are otherwise.
    pub async fn respond(
        &self,
        method: &Method,
        uri: &Uri,
        request_headers: &HeaderMap,
    ) -> Result<Reply, Box<Error>> {
        if method != Method::GET && method != Method::HEAD {
            warn!("Denying method {method}");
            return Ok(Reply::standard(StatusCode::METHOD_NOT_ALLOWED));
        }

        let Some(url) = self.request_url(uri) else {
            warn!("rejecting invalid URI {uri}");
            return Ok(Reply::standard(StatusCode::BAD_REQUEST));
        };

        if is_rewritten(&url) {
            debug!("serving rewritten resource {url}");
            return from_engine(self.engine.fetch_resource(url.as_str(), request_headers).await);
        }

        let Some(mut path) = resolve_path(uri.path(), &self.root) else {
            warn!("rejecting invalid path {}", uri.path());
            return Ok(Reply::standard(StatusCode::BAD_REQUEST));
        };
        if path.is_dir() {
            debug!("using directory index file {INDEX_FILE}");
            path.push(INDEX_FILE);
        }

        if is_html(&path) {
            self.document(&url, &path, request_headers).await
        } else if self.conf.rewrite.in_place_rewriting {
            debug!("serving {url} in place");
            from_engine(self.engine.fetch_in_place(url.as_str()).await)
        } else {
            Ok(file(&path).await)
        }
    }

    fn request_url(&self, uri: &Uri) -> Option<Url> {
        let path_and_query = uri.path_and_query().map_or("/", |value| value.as_str());
        self.base_url
            .join(path_and_query.trim_start_matches('/'))
            .ok()
    }

    async fn document(
        &self,
        url: &Url,
        path: &Path,
        request_headers: &HeaderMap,
    ) -> Result<Reply, Box<Error>> {
        let html = match tokio::fs::read_to_string(path).await {
            Ok(html) => html,
            Err(err) => return Ok(file_error(path, err)),
        };

        let mut driver = self.engine.new_driver(url.as_str(), request_headers)?;
        driver.parse(&html);
        let html = driver.finish().await;
        info!("rewrote document {url}");

        let mut reply = Reply::new(StatusCode::OK, "text/html;charset=utf-8", html);
        reply.headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=0, no-cache"),
        );
        Ok(reply)
    }
}

impl TryFrom<PagespeedConf> for PagespeedHandler {
    type Error = Box<Error>;

    /// Creates a handler from its configuration. This will canonicalize the path to the root
    /// directory and might result in an error if that path isn’t accessible.
    fn try_from(conf: PagespeedConf) -> Result<Self, Self::Error> {
        Self::with_builder(conf, |builder| builder)
    }
}

#[async_trait]
impl RequestFilter for PagespeedHandler {
    type Conf = PagespeedConf;

    type CTX = ();

    fn new_ctx() -> Self::CTX {}

    /// Responds to every request, the result is always [`RequestFilterResult::ResponseSent`]
    /// unless writing the response fails.
    async fn request_filter(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        let request = session.req_header();
        let method = request.method.clone();
        let uri = request.uri.clone();
        let headers = request.headers.clone();
        debug!("received URI path {}", uri.path());

        let reply = self.respond(&method, &uri, &headers).await?;

        let mut header = ResponseHeader::build(reply.status, Some(reply.headers.len() + 1))?;
        for (name, value) in &reply.headers {
            header.append_header(name.clone(), value.clone())?;
        }
        header.insert_header(header::CONTENT_LENGTH, reply.body.len().to_string())?;

        let send_body = method != Method::HEAD && !reply.body.is_empty();
        session
            .write_response_header(Box::new(header), !send_body)
            .await?;
        if send_body {
            session.write_response_body(Some(reply.body), true).await?;
        }
        Ok(RequestFilterResult::ResponseSent)
    }
}

fn is_rewritten(url: &Url) -> bool {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .is_some_and(|leaf| leaf.contains(".pagespeed."))
}

fn is_html(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            extension.eq_ignore_ascii_case("html") || extension.eq_ignore_ascii_case("htm")
        })
}

/// Maps a URI path to a file below the root directory. `None` for paths that cannot be decoded
/// or try to leave the root directory.
fn resolve_path(uri_path: &str, root: &Path) -> Option<PathBuf> {
    let decoded = percent_decode_str(uri_path).decode_utf8().ok()?;
    let mut path = root.to_path_buf();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            segment if segment.contains(|c| c == '\\' || c == '\0') => return None,
            segment => path.push(segment),
        }
    }
    Some(path)
}

fn from_engine(result: Result<ServedResource, Box<Error>>) -> Result<Reply, Box<Error>> {
    match result {
        Ok(served) => Ok(served.into()),
        Err(err) => match err.etype() {
            ErrorType::HTTPStatus(code) => {
                debug!("engine declined the request: {err}");
                Ok(Reply::standard(
                    StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                ))
            }
            _ => Err(err),
        },
    }
}

fn file_error(path: &Path, err: std::io::Error) -> Reply {
    let status = match err.kind() {
        ErrorKind::NotFound => {
            debug!("file {path:?} not found");
            StatusCode::NOT_FOUND
        }
        ErrorKind::PermissionDenied => {
            debug!("reading {path:?} resulted in PermissionDenied error");
            StatusCode::FORBIDDEN
        }
        _ => {
            warn!("failed reading {path:?}: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    Reply::standard(status)
}

async fn file(path: &Path) -> Reply {
    match tokio::fs::read(path).await {
        Ok(contents) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            let content_type = if mime.type_() == mime_guess::mime::TEXT {
                format!("{mime};charset=utf-8")
            } else {
                mime.to_string()
            };
            Reply::new(StatusCode::OK, &content_type, contents)
        }
        Err(err) => file_error(path, err),
    }
}
