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

//! Serving resources: reconstruction of rewritten URLs and in-place optimization of resources
//! requested at their original URLs.

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, StatusCode};
use log::{debug, trace};
use pingora_error::{Error, ErrorType};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::cache::HttpCacheLookup;
use crate::driver::{DriverState, FetchOutcome};
use crate::engine::{Engine, LoadMode};
use crate::filter::{HashMismatchPolicy, RewriteFilter};
use crate::headers::{
    etag_matches, insert_header, set_long_lived, set_short_private, strip_cookies,
    ServedResource,
};
use crate::metadata::{self, Lookup};
use crate::namer::{split_rewritten_url, ResourceNamer};
use crate::resource::Resource;
use crate::slot::SlotKind;
use crate::stats::Counter;
use crate::user_agent::ResourceContext;

const X_ORIGINAL_CONTENT_LENGTH: HeaderName = HeaderName::from_static("x-original-content-length");

/// Id of the filter performing in-place rewrites
pub const IN_PLACE_FILTER: &str = "aj";

/// A validated request for a rewritten resource
#[derive(Debug)]
struct RequestedOutput {
    url: Url,
    namer: ResourceNamer,
    filter: Arc<dyn RewriteFilter>,
    inputs: Vec<String>,
    context: ResourceContext,
}

fn not_found(url: &str, reason: &str) -> Box<Error> {
    debug!("not serving {url}: {reason}");
    Error::explain(
        ErrorType::HTTPStatus(404),
        format!("{url} is not a valid rewritten URL: {reason}"),
    )
}

fn etag(namer: &ResourceNamer, hash: &str) -> String {
    format!("W/\"{}-{hash}\"", namer.id)
}

impl Engine {
    fn decode_request(&self, url: &str) -> Result<RequestedOutput, Box<Error>> {
        let parsed = Url::parse(url).map_err(|_| not_found(url, "unparsable"))?;
        let (base, namer) =
            split_rewritten_url(&parsed).ok_or_else(|| not_found(url, "not a rewritten name"))?;
        let filter = self
            .filter(&namer.id)
            .cloned()
            .ok_or_else(|| not_found(url, "unknown filter"))?;

        let encoder = filter.encoder();
        let (relative, context) = encoder
            .decode(&namer.name)
            .ok_or_else(|| not_found(url, "malformed name"))?;
        if encoder.encode(&relative, &context) != namer.name {
            return Err(not_found(url, "name doesn't round-trip"));
        }

        let inputs = relative
            .iter()
            .map(|relative| {
                base.join(relative)
                    .ok()
                    .filter(|input| matches!(input.scheme(), "http" | "https"))
                    .map(String::from)
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| not_found(url, "invalid input URL"))?;

        Ok(RequestedOutput {
            url: parsed,
            namer,
            filter,
            inputs,
            context,
        })
    }

    /// Response for an output that is current
    fn serve_output(
        &self,
        request: &RequestedOutput,
        mut headers: HeaderMap,
        body: Bytes,
        request_headers: &HeaderMap,
        original_length: Option<usize>,
    ) -> ServedResource {
        let now = self.inner.timer.now_ms();
        let etag = etag(&request.namer, &request.namer.hash);
        if etag_matches(request_headers, &etag) {
            trace!("{} not modified", request.url);
            return ServedResource::not_modified(&etag, now);
        }

        strip_cookies(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        set_long_lived(&mut headers, now);
        insert_header(&mut headers, header::ETAG, &etag);
        if let Some(length) = original_length {
            insert_header(&mut headers, X_ORIGINAL_CONTENT_LENGTH, &length.to_string());
        }
        ServedResource::new(StatusCode::OK, headers, body)
    }

    /// The unoptimized input served in place of an output that couldn't be produced. Only
    /// acceptable for filters that merely optimize.
    async fn fallback(
        &self,
        request: &RequestedOutput,
        inputs: Vec<Resource>,
    ) -> Result<ServedResource, Box<Error>> {
        let url = request.url.as_str();
        if !request.filter.optimization_only() {
            return Err(not_found(url, "output cannot be produced"));
        }
        let Some(first) = request.inputs.first() else {
            return Err(not_found(url, "no inputs"));
        };
        let input = match inputs
            .into_iter()
            .find(|input| input.url() == first && input.is_loaded())
        {
            Some(input) => input,
            None => self.load_input(first.clone(), LoadMode::Cached).await,
        };
        if !input.is_loaded() {
            return Err(not_found(url, "input unavailable"));
        }

        debug!("serving {first} in place of {url}");
        self.inner.stats.add(Counter::FallbacksServed);
        let mut headers = input.headers().clone();
        strip_cookies(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        set_short_private(
            &mut headers,
            self.inner.timer.now_ms(),
            self.inner.options.implicit_cache_ttl_ms,
        );
        Ok(ServedResource::new(
            StatusCode::OK,
            headers,
            input.contents().clone(),
        ))
    }

    async fn run_fetch_context(
        &self,
        request: &RequestedOutput,
        force_rewrite: bool,
    ) -> FetchOutcome {
        let mut state = DriverState::for_fetch(self.clone(), &request.url);
        let id = state.initiate_fetch(
            request.filter.clone(),
            &request.inputs,
            Vec::new(),
            SlotKind::Fetch,
            request.context.clone(),
            force_rewrite,
        );
        let deadline = request.filter.optimization_only().then(|| {
            Instant::now() + Duration::from_millis(self.inner.options.fetch_deadline_ms)
        });
        state
            .run_until(deadline, |state| state.context(id).is_finished())
            .await;
        let outcome = state.fetch_outcome(id, &request.inputs);
        state.detach();
        outcome
    }

    /// Serves a rewritten resource. The output is taken from the HTTP cache if possible,
    /// otherwise it is reconstructed from its inputs. Requests for outdated hashes are
    /// redirected or served the current output depending on the filter. If the output cannot be
    /// produced in time, optimizing filters serve the original input instead.
    ///
    /// Malformed URLs and URLs of unknown filters produce `HTTPStatus(404)` errors.
    pub async fn fetch_resource(
        &self,
        url: &str,
        request_headers: &HeaderMap,
    ) -> Result<ServedResource, Box<Error>> {
        let request = self.decode_request(url)?;
        if let HttpCacheLookup::Found(value) = self.inner.http_cache.find(url).await {
            trace!("{url} found in HTTP cache");
            return Ok(self.serve_output(
                &request,
                value.headers,
                value.body,
                request_headers,
                None,
            ));
        }

        for force_rewrite in [false, true] {
            let outcome = self.run_fetch_context(&request, force_rewrite).await;
            if !outcome.finished {
                debug!("reconstructing {url} missed the deadline");
                return self.fallback(&request, outcome.inputs).await;
            }
            let (true, Some(current_url), Some(hash)) =
                (outcome.optimizable, outcome.url.clone(), outcome.hash.clone())
            else {
                debug!("{url} cannot be reconstructed");
                return self.fallback(&request, outcome.inputs).await;
            };

            let output = match outcome.output {
                Some(output) => Some((output.headers().clone(), output.contents().clone())),
                None => match self.inner.http_cache.find(&current_url).await {
                    HttpCacheLookup::Found(value) => Some((value.headers, value.body)),
                    _ => None,
                },
            };
            let Some((headers, body)) = output else {
                debug!("output {current_url} is no longer available, rewriting");
                continue;
            };

            if hash == request.namer.hash {
                let original_length = outcome
                    .inputs
                    .iter()
                    .map(|input| input.contents().len())
                    .sum();
                return Ok(self.serve_output(
                    &request,
                    headers,
                    body,
                    request_headers,
                    Some(original_length),
                ));
            }

            let now = self.inner.timer.now_ms();
            let ttl = self.inner.options.implicit_cache_ttl_ms;
            return Ok(match request.filter.hash_mismatch_policy() {
                HashMismatchPolicy::Redirect => {
                    debug!("redirecting outdated {url} to {current_url}");
                    ServedResource::redirect(&current_url, now, ttl)
                }
                HashMismatchPolicy::ServeCurrent => {
                    debug!("serving {current_url} for outdated {url}");
                    let mut headers = headers;
                    strip_cookies(&mut headers);
                    headers.remove(header::CONTENT_LENGTH);
                    set_short_private(&mut headers, now, ttl);
                    ServedResource::new(StatusCode::OK, headers, body)
                }
            });
        }
        Err(not_found(url, "output not reproducible"))
    }

    /// Serves a resource at its original URL, optimized if an optimized version is known.
    /// Otherwise the original is served with a short private lifetime and an optimization is
    /// started in the background for subsequent requests.
    pub async fn fetch_in_place(&self, url: &str) -> Result<ServedResource, Box<Error>> {
        let parsed = Url::parse(url).map_err(|err| {
            Error::because(ErrorType::HTTPStatus(404), format!("invalid URL {url}"), err)
        })?;
        let filter = self.filter(IN_PLACE_FILTER).cloned().ok_or_else(|| {
            Error::explain(
                ErrorType::InternalError,
                "in-place rewriting filter not registered",
            )
        })?;
        let urls = vec![url.to_owned()];
        let context = ResourceContext::default();
        let now = self.inner.timer.now_ms();

        let key = metadata::partition_key(
            self.inner.hasher.as_ref(),
            filter.as_ref(),
            &urls,
            &context,
        );
        if let Lookup::Hit(record) = metadata::lookup(self, &key, 1).await {
            let known = record
                .partitions
                .first()
                .filter(|partition| partition.optimizable)
                .and_then(|partition| {
                    let expiration_ms = partition.input_info.first()?.expiration_ms;
                    Some((partition.url.clone()?, expiration_ms))
                });
            if let Some((output_url, expiration_ms)) = known {
                if let HttpCacheLookup::Found(value) =
                    self.inner.http_cache.find(&output_url).await
                {
                    debug!("serving {output_url} in place of {url}");
                    let mut headers = value.headers;
                    strip_cookies(&mut headers);
                    headers.remove(header::CONTENT_LENGTH);
                    headers.remove(header::EXPIRES);
                    insert_header(
                        &mut headers,
                        header::CACHE_CONTROL,
                        &format!("max-age={}", (expiration_ms - now).max(0) / 1000),
                    );
                    return Ok(ServedResource::new(StatusCode::OK, headers, value.body));
                }
            }
        }

        let input = self.load_input(url.to_owned(), LoadMode::Cached).await;
        if !input.is_loaded() {
            return Err(Error::explain(
                ErrorType::HTTPStatus(404),
                format!("{url} could not be loaded: {:?}", input.state()),
            ));
        }

        trace!("optimizing {url} in the background");
        let mut state = DriverState::for_fetch(self.clone(), &parsed);
        state.initiate_fetch(
            filter,
            &urls,
            vec![input.clone()],
            SlotKind::Null,
            context,
            false,
        );
        state.detach();

        let mut headers = input.headers().clone();
        strip_cookies(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        set_short_private(&mut headers, now, self.inner.options.implicit_cache_ttl_ms);
        Ok(ServedResource::new(
            StatusCode::OK,
            headers,
            input.contents().clone(),
        ))
    }
}
