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

//! Splits HTML text into tokens. Input can arrive in chunks, incomplete constructs at the
//! end of a chunk are kept until more data or the end of the document.

/// An attribute of a start tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Lower-case attribute name
    pub name: String,
    /// Unescaped value, `None` for attributes without a value
    pub value: Option<String>,
}

/// A start tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Lower-case tag name
    pub name: String,
    /// Attributes in source order
    pub attributes: Vec<Attribute>,
    /// Whether the tag was written as `<tag/>`
    pub self_closing: bool,
}

impl Element {
    /// Value of an attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .and_then(|attribute| attribute.value.as_deref())
    }

    /// Sets an attribute value, adding the attribute if necessary
    pub fn set_attribute(&mut self, name: &str, value: &str) {
        match self
            .attributes
            .iter_mut()
            .find(|attribute| attribute.name == name)
        {
            Some(attribute) => attribute.value = Some(value.to_owned()),
            None => self.attributes.push(Attribute {
                name: name.to_owned(),
                value: Some(value.to_owned()),
            }),
        }
    }

    /// Whether this element never has contents or an end tag
    pub fn is_void(&self) -> bool {
        self.self_closing
            || matches!(
                self.name.as_str(),
                "area"
                    | "base"
                    | "br"
                    | "col"
                    | "embed"
                    | "hr"
                    | "img"
                    | "input"
                    | "link"
                    | "meta"
                    | "param"
                    | "source"
                    | "track"
                    | "wbr"
            )
    }

    /// Serializes the start tag
    pub fn to_html(&self) -> String {
        let mut result = format!("<{}", self.name);
        for attribute in &self.attributes {
            result.push(' ');
            result.push_str(&attribute.name);
            if let Some(value) = &attribute.value {
                result.push_str("=\"");
                result.push_str(&escape_attribute(value));
                result.push('"');
            }
        }
        if self.self_closing {
            result.push_str("/>");
        } else {
            result.push('>');
        }
        result
    }
}

/// A lexical unit of an HTML document
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    /// Character data
    Text(String),
    /// A start tag along with its source text
    StartTag(Element, String),
    /// An end tag along with its lower-case name
    EndTag(String, String),
    /// Comments, doctype and anything else passed through as is
    Raw(String),
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

fn unescape_attribute(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn parse_start_tag(source: &str) -> Option<Element> {
    let inner = source.strip_prefix('<')?.strip_suffix('>')?;
    let (inner, self_closing) = match inner.strip_suffix('/') {
        Some(inner) => (inner, true),
        None => (inner, false),
    };
    let bytes = inner.as_bytes();
    let name_end = bytes
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let name = inner[..name_end].to_ascii_lowercase();
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }

    let mut attributes = Vec::new();
    let mut pos = name_end;
    loop {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b'/') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        let start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() && bytes[pos] != b'=' {
            pos += 1;
        }
        let attr_name = inner[start..pos].to_ascii_lowercase();
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let value = if bytes.get(pos) == Some(&b'=') {
            pos += 1;
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            match bytes.get(pos) {
                Some(quote @ (b'"' | b'\'')) => {
                    let value_start = pos + 1;
                    let value_end = inner[value_start..]
                        .find(char::from(*quote))
                        .map_or(bytes.len(), |end| value_start + end);
                    pos = (value_end + 1).min(bytes.len());
                    Some(unescape_attribute(&inner[value_start..value_end]))
                }
                _ => {
                    let value_start = pos;
                    while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
                        pos += 1;
                    }
                    Some(unescape_attribute(&inner[value_start..pos]))
                }
            }
        } else {
            None
        };
        if !attr_name.is_empty() {
            attributes.push(Attribute {
                name: attr_name,
                value,
            });
        }
    }

    Some(Element {
        name,
        attributes,
        self_closing,
    })
}

/// Finds the end of a tag starting at `start`, respecting quoted attribute values
fn tag_end(input: &str, start: usize) -> Option<usize> {
    let mut quote = None;
    for (pos, c) in input[start..].char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if q == c => quote = None,
            (None, '>') => return Some(start + pos + 1),
            _ => {}
        }
    }
    None
}

/// Incremental HTML tokenizer
#[derive(Debug, Default)]
pub(crate) struct Lexer {
    buffer: String,
    raw_text_element: Option<String>,
}

impl Lexer {
    /// Adds a chunk of input and returns all tokens that are complete
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<Token> {
        self.buffer.push_str(chunk);
        self.tokenize(false)
    }

    /// Returns all remaining tokens at the end of the document
    pub(crate) fn finish(&mut self) -> Vec<Token> {
        self.tokenize(true)
    }

    fn tokenize(&mut self, at_end: bool) -> Vec<Token> {
        let input = std::mem::take(&mut self.buffer);
        let mut tokens = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            if let Some(element) = self.raw_text_element.clone() {
                // Contents of script and style elements extend to their end tag
                let closing = format!("</{element}");
                let lower = input[pos..].to_ascii_lowercase();
                match lower.find(&closing) {
                    Some(offset) => {
                        if offset > 0 {
                            tokens.push(Token::Text(input[pos..pos + offset].to_owned()));
                        }
                        pos += offset;
                        self.raw_text_element = None;
                    }
                    None if at_end => {
                        tokens.push(Token::Text(input[pos..].to_owned()));
                        pos = input.len();
                    }
                    None => break,
                }
                continue;
            }

            let Some(offset) = input[pos..].find('<') else {
                tokens.push(Token::Text(input[pos..].to_owned()));
                pos = input.len();
                break;
            };
            if offset > 0 {
                tokens.push(Token::Text(input[pos..pos + offset].to_owned()));
                pos += offset;
            }

            let rest = &input[pos..];
            if rest.starts_with("<!--") {
                match rest.find("-->") {
                    Some(end) => {
                        tokens.push(Token::Raw(rest[..end + 3].to_owned()));
                        pos += end + 3;
                    }
                    None if at_end => {
                        tokens.push(Token::Raw(rest.to_owned()));
                        pos = input.len();
                    }
                    None => break,
                }
                continue;
            }

            let Some(end) = tag_end(&input, pos) else {
                if at_end {
                    tokens.push(Token::Text(rest.to_owned()));
                    pos = input.len();
                }
                break;
            };
            let source = &input[pos..end];
            if let Some(name) = source.strip_prefix("</") {
                let name = name
                    .trim_end_matches('>')
                    .trim()
                    .to_ascii_lowercase();
                tokens.push(Token::EndTag(name, source.to_owned()));
            } else if source.starts_with("<!") || source.starts_with("<?") {
                tokens.push(Token::Raw(source.to_owned()));
            } else if let Some(element) = parse_start_tag(source) {
                if matches!(element.name.as_str(), "script" | "style") && !element.self_closing {
                    self.raw_text_element = Some(element.name.clone());
                }
                tokens.push(Token::StartTag(element, source.to_owned()));
            } else {
                tokens.push(Token::Text(source.to_owned()));
            }
            pos = end;
        }

        self.buffer = input[pos..].to_owned();
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(source: &str) -> Element {
        parse_start_tag(source).unwrap()
    }

    #[test]
    fn parses_attributes() {
        let element =
            start(r#"<LINK rel=stylesheet href="a.css?x=1&amp;y=2" disabled media='all'>"#);
        assert_eq!(element.name, "link");
        assert_eq!(element.attribute("rel"), Some("stylesheet"));
        assert_eq!(element.attribute("href"), Some("a.css?x=1&y=2"));
        assert_eq!(element.attribute("media"), Some("all"));
        assert_eq!(element.attribute("disabled"), None);
        assert_eq!(element.attributes.len(), 4);
        assert!(element.is_void());
        assert_eq!(
            element.to_html(),
            r#"<link rel="stylesheet" href="a.css?x=1&amp;y=2" disabled media="all">"#
        );

        let element = start("<img src=a.png/>");
        assert_eq!(element.attribute("src"), Some("a.png"));
        let element = start(r#"<img src="a.png"/>"#);
        assert!(element.self_closing);
        assert_eq!(element.attribute("src"), Some("a.png"));
    }

    #[test]
    fn tokenizes_chunks() {
        let mut lexer = Lexer::default();
        let mut tokens = lexer.feed("<!DOCTYPE html><p class=\"a>b\">Hi<br");
        assert_eq!(tokens.len(), 3);
        assert!(matches!(&tokens[0], Token::Raw(source) if source == "<!DOCTYPE html>"));
        assert!(matches!(
            &tokens[1],
            Token::StartTag(element, _) if element.attribute("class") == Some("a>b")
        ));
        assert!(matches!(&tokens[2], Token::Text(text) if text == "Hi"));

        tokens = lexer.feed("></p><!-- c");
        assert_eq!(tokens.len(), 2);
        assert!(matches!(&tokens[0], Token::StartTag(element, _) if element.name == "br"));
        assert!(matches!(&tokens[1], Token::EndTag(name, _) if name == "p"));

        tokens = lexer.finish();
        assert_eq!(tokens, vec![Token::Raw("<!-- c".into())]);
    }

    #[test]
    fn raw_text_elements() {
        let mut lexer = Lexer::default();
        let tokens = lexer.feed("<script>if (a < b) {}</SCRIPT><style>p{}</st");
        assert_eq!(tokens.len(), 4);
        assert!(matches!(&tokens[1], Token::Text(text) if text == "if (a < b) {}"));
        assert!(matches!(&tokens[2], Token::EndTag(name, _) if name == "script"));
        assert!(matches!(&tokens[3], Token::StartTag(element, _) if element.name == "style"));

        let tokens = lexer.feed("yle>");
        assert_eq!(tokens.len(), 2);
        assert!(matches!(&tokens[0], Token::Text(text) if text == "p{}"));
        assert!(matches!(&tokens[1], Token::EndTag(name, _) if name == "style"));
    }
}
