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

//! Content types of inputs and outputs.

/// Broad classification of a content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// HTML documents
    Html,
    /// Stylesheets
    Css,
    /// Scripts
    JavaScript,
    /// Any image format
    Image,
    /// Other text formats
    Text,
    /// Anything else
    Other,
}

/// A MIME type along with its classification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentType {
    mime: String,
    kind: ContentKind,
}

impl ContentType {
    /// `text/css`
    pub fn css() -> Self {
        Self::from_mime("text/css")
    }

    /// `text/javascript`
    pub fn javascript() -> Self {
        Self::from_mime("text/javascript")
    }

    /// `text/html`
    pub fn html() -> Self {
        Self::from_mime("text/html")
    }

    /// Parses a `Content-Type` header value, parameters are dropped.
    pub fn from_mime(value: &str) -> Self {
        let mime = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let kind = match mime.as_str() {
            "text/html" | "application/xhtml+xml" => ContentKind::Html,
            "text/css" => ContentKind::Css,
            "text/javascript" | "application/javascript" | "application/x-javascript" => {
                ContentKind::JavaScript
            }
            _ if mime.starts_with("image/") => ContentKind::Image,
            _ if mime.starts_with("text/") => ContentKind::Text,
            _ => ContentKind::Other,
        };
        Self { mime, kind }
    }

    /// Guesses the content type from the file extension in a URL or path.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        mime_guess::from_path(path)
            .first()
            .map(|mime| Self::from_mime(mime.essence_str()))
    }

    /// The MIME type without parameters
    pub fn mime(&self) -> &str {
        &self.mime
    }

    /// The classification of this type
    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// The file extension used for rewritten resources of this type
    pub fn extension(&self) -> Option<&'static str> {
        Some(match self.mime.as_str() {
            "text/html" => "html",
            "text/css" => "css",
            "text/javascript" | "application/javascript" | "application/x-javascript" => "js",
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/svg+xml" => "svg",
            "image/x-icon" | "image/vnd.microsoft.icon" => "ico",
            "text/plain" => "txt",
            _ => return None,
        })
    }

    /// Whether a `charset` parameter should be appended when serving
    pub fn is_text(&self) -> bool {
        matches!(
            self.kind,
            ContentKind::Html | ContentKind::Css | ContentKind::JavaScript | ContentKind::Text
        )
    }
}
