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

//! A scanner for URL references in stylesheets. It only understands as much CSS as necessary
//! to find `url()` values and `@import` strings, anything else is passed through unchanged.

use std::ops::Range;

/// A URL referenced by a stylesheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssUrl {
    /// Position of the URL text (without quotes) in the stylesheet
    pub range: Range<usize>,
    /// The URL as written
    pub url: String,
}

fn skip_comment(bytes: &[u8], pos: usize) -> usize {
    let mut pos = pos + 2;
    while pos + 1 < bytes.len() {
        if bytes[pos] == b'*' && bytes[pos + 1] == b'/' {
            return pos + 2;
        }
        pos += 1;
    }
    bytes.len()
}

fn skip_whitespace(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Reads a quoted string starting at the quote, returns the range of its contents and the
/// position after the closing quote.
fn quoted(bytes: &[u8], pos: usize) -> Option<(Range<usize>, usize)> {
    let quote = bytes[pos];
    let start = pos + 1;
    let mut end = start;
    while end < bytes.len() {
        match bytes[end] {
            b'\\' => end += 2,
            b'\n' => return None,
            c if c == quote => return Some((start..end, end + 1)),
            _ => end += 1,
        }
    }
    None
}

fn url_function(css: &str, pos: usize) -> Option<(CssUrl, usize)> {
    let bytes = css.as_bytes();
    let mut pos = skip_whitespace(bytes, pos + 4);
    let range = match bytes.get(pos)? {
        b'"' | b'\'' => {
            let (range, after) = quoted(bytes, pos)?;
            pos = skip_whitespace(bytes, after);
            range
        }
        _ => {
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b')' && !bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            let range = start..pos;
            pos = skip_whitespace(bytes, pos);
            range
        }
    };
    if bytes.get(pos) != Some(&b')') || range.is_empty() {
        return None;
    }
    let url = css.get(range.clone())?.to_owned();
    Some((CssUrl { range, url }, pos + 1))
}

fn import_rule(css: &str, pos: usize) -> Option<(CssUrl, usize)> {
    let bytes = css.as_bytes();
    let pos = skip_whitespace(bytes, pos + "@import".len());
    match bytes.get(pos)? {
        b'"' | b'\'' => {
            let (range, after) = quoted(bytes, pos)?;
            let url = css.get(range.clone())?.to_owned();
            Some((CssUrl { range, url }, after))
        }
        _ => None,
    }
}

/// Finds all URLs referenced by a stylesheet, in order.
pub fn find_urls(css: &str) -> Vec<CssUrl> {
    let bytes = css.as_bytes();
    let mut result = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let rest = &bytes[pos..];
        if rest.starts_with(b"/*") {
            pos = skip_comment(bytes, pos);
        } else if rest.len() >= 4 && rest[..4].eq_ignore_ascii_case(b"url(") {
            match url_function(css, pos) {
                Some((url, next)) => {
                    result.push(url);
                    pos = next;
                }
                None => pos += 4,
            }
        } else if rest.len() >= 7 && rest[..7].eq_ignore_ascii_case(b"@import") {
            match import_rule(css, pos) {
                Some((url, next)) => {
                    result.push(url);
                    pos = next;
                }
                None => pos += 7,
            }
        } else if matches!(rest[0], b'"' | b'\'') {
            pos = quoted(bytes, pos).map_or(pos + 1, |(_, next)| next);
        } else {
            pos += 1;
        }
    }
    result
}

/// Replaces URLs found by [`find_urls`]. `replacements` lists the URLs to be changed, by their
/// position in the result of `find_urls`.
pub fn replace_urls(css: &str, urls: &[CssUrl], replacements: &[(usize, String)]) -> String {
    let mut result = String::with_capacity(css.len());
    let mut last = 0;
    let mut replacements = replacements.to_vec();
    replacements.sort_by_key(|(index, _)| *index);
    for (index, replacement) in replacements {
        let Some(url) = urls.get(index) else {
            continue;
        };
        if url.range.start < last {
            continue;
        }
        result.push_str(&css[last..url.range.start]);
        result.push_str(&replacement);
        last = url.range.end;
    }
    result.push_str(&css[last..]);
    result
}

/// Checks whether a URL refers to an external resource that could be rewritten
pub fn is_rewritable_url(url: &str) -> bool {
    !url.is_empty()
        && !url.starts_with('#')
        && !url
            .get(..5)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
}
