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

//! Encoding of input URLs (and auxiliary data) into the name segment of rewritten URLs.
//!
//! Inputs are encoded relative to the directory of the rewritten URL. Decoding has to
//! round-trip: a name that doesn't re-encode to itself is rejected.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt::Debug;

use crate::user_agent::ResourceContext;

const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

fn escape(url: &str) -> String {
    utf8_percent_encode(url, SEGMENT).to_string()
}

fn unescape(segment: &str) -> Option<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Packs relative input URLs and resource context data into a URL segment and back
pub trait UrlSegmentEncoder: Debug + Send + Sync {
    /// Encodes relative input URLs
    fn encode(&self, urls: &[String], context: &ResourceContext) -> String;

    /// Decodes a segment into relative input URLs and the resource context. `None` if the
    /// segment is malformed.
    fn decode(&self, segment: &str) -> Option<(Vec<String>, ResourceContext)>;
}

/// The default encoder: escaped relative URLs joined with `+`
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlMultipartEncoder;

impl UrlSegmentEncoder for UrlMultipartEncoder {
    fn encode(&self, urls: &[String], _context: &ResourceContext) -> String {
        urls.iter()
            .map(|url| escape(url))
            .collect::<Vec<_>>()
            .join("+")
    }

    fn decode(&self, segment: &str) -> Option<(Vec<String>, ResourceContext)> {
        let urls = segment
            .split('+')
            .map(|part| {
                if part.is_empty() {
                    None
                } else {
                    unescape(part)
                }
            })
            .collect::<Option<Vec<_>>>()?;
        Some((urls, ResourceContext::default()))
    }
}

/// Encoder for a single image URL, prefixed with the desired dimensions: `32x48xlogo.png`,
/// or `xlogo.png` if no dimensions are known.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageUrlEncoder;

impl UrlSegmentEncoder for ImageUrlEncoder {
    fn encode(&self, urls: &[String], context: &ResourceContext) -> String {
        let url = urls.first().map(|url| escape(url)).unwrap_or_default();
        match context.dimensions {
            Some((width, height)) => format!("{width}x{height}x{url}"),
            None => format!("x{url}"),
        }
    }

    fn decode(&self, segment: &str) -> Option<(Vec<String>, ResourceContext)> {
        let mut context = ResourceContext::default();
        let url = if let Some(url) = segment.strip_prefix('x') {
            url
        } else {
            let (width, rest) = segment.split_once('x')?;
            let (height, url) = rest.split_once('x')?;
            if !width.bytes().all(|b| b.is_ascii_digit())
                || !height.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            context.dimensions = Some((width.parse().ok()?, height.parse().ok()?));
            url
        };
        if url.is_empty() {
            return None;
        }
        Some((vec![unescape(url)?], context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|url| url.to_string()).collect()
    }

    #[test]
    fn multipart() {
        let encoder = UrlMultipartEncoder;
        let context = ResourceContext::default();
        let encoded = encoder.encode(&urls(&["a.css", "sub/b c.css", "x+y.css"]), &context);
        assert_eq!(encoded, "a.css+sub%2Fb%20c.css+x%2By.css");
        assert_eq!(
            encoder.decode(&encoded),
            Some((urls(&["a.css", "sub/b c.css", "x+y.css"]), context))
        );

        assert_eq!(encoder.encode(&urls(&["a.css"]), &ResourceContext::default()), "a.css");
        assert_eq!(encoder.decode("a.css++b.css"), None);
        assert_eq!(encoder.decode("%FF.css"), None);
    }

    #[test]
    fn image_dimensions() {
        let encoder = ImageUrlEncoder;
        let context = ResourceContext {
            dimensions: Some((32, 48)),
            ..Default::default()
        };
        let encoded = encoder.encode(&urls(&["logo.png"]), &context);
        assert_eq!(encoded, "32x48xlogo.png");
        assert_eq!(
            encoder.decode(&encoded),
            Some((urls(&["logo.png"]), context))
        );

        let encoded = encoder.encode(&urls(&["logo.png"]), &ResourceContext::default());
        assert_eq!(encoded, "xlogo.png");
        assert_eq!(
            encoder.decode(&encoded),
            Some((urls(&["logo.png"]), ResourceContext::default()))
        );

        assert_eq!(encoder.decode("logo.png"), None);
        assert_eq!(encoder.decode("3ax4xlogo.png"), None);
        assert_eq!(encoder.decode("x"), None);
    }
}
