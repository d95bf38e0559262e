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

//! The part of an HTML document that hasn't been flushed yet, with the element mutations
//! rendering needs: changing attributes and deleting elements.

use super::lexer::{Element, Token};

/// Reference to an element of the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub(crate) usize);

#[derive(Debug)]
enum NodeData {
    Text(String),
    Start {
        element: Box<Element>,
        source: String,
        modified: bool,
        end: Option<usize>,
    },
    End(String),
    Raw(String),
}

#[derive(Debug)]
struct Node {
    data: NodeData,
    deleted: bool,
}

/// Document nodes in source order. Nodes are kept until the document is flushed, at that
/// point they are serialized and can no longer be changed.
#[derive(Debug, Default)]
pub struct HtmlDocument {
    nodes: Vec<Node>,
    flushed: usize,
    open: Vec<usize>,
}

/// A node added to the document, as reported to filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Added {
    Text(String),
    Start(ElementId),
    End(Option<ElementId>),
    Other,
}

impl HtmlDocument {
    /// Creates an empty document
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, token: Token) -> Added {
        let index = self.nodes.len();
        let (data, added) = match token {
            Token::Text(text) => (NodeData::Text(text.clone()), Added::Text(text)),
            Token::Raw(source) => (NodeData::Raw(source), Added::Other),
            Token::StartTag(element, source) => {
                if !element.is_void() {
                    self.open.push(index);
                }
                (
                    NodeData::Start {
                        element: Box::new(element),
                        source,
                        modified: false,
                        end: None,
                    },
                    Added::Start(ElementId(index)),
                )
            }
            Token::EndTag(name, source) => {
                let start = self.close(&name, index);
                (NodeData::End(source), Added::End(start.map(ElementId)))
            }
        };
        self.nodes.push(Node {
            data,
            deleted: false,
        });

        // An element deleted while open takes everything up to its end tag along
        if let Added::End(Some(ElementId(start))) = &added {
            if self.nodes[*start].deleted {
                for node in &mut self.nodes[*start..] {
                    node.deleted = true;
                }
            }
        }
        added
    }

    fn close(&mut self, name: &str, end: usize) -> Option<usize> {
        let position = self.open.iter().rposition(|&start| {
            matches!(
                &self.nodes[start].data,
                NodeData::Start { element, .. } if element.name == name
            )
        })?;
        let start = self.open[position];
        self.open.truncate(position);
        if let NodeData::Start { end: slot, .. } = &mut self.nodes[start].data {
            *slot = Some(end);
        }
        Some(start)
    }

    /// Returns an element that hasn't been flushed yet
    pub fn element(&self, id: ElementId) -> Option<&Element> {
        if id.0 < self.flushed {
            return None;
        }
        match &self.nodes.get(id.0)?.data {
            NodeData::Start { element, .. } => Some(element.as_ref()),
            _ => None,
        }
    }

    /// Changes an attribute of an element that hasn't been flushed yet
    pub fn set_attribute(&mut self, id: ElementId, name: &str, value: &str) -> bool {
        if id.0 < self.flushed {
            return false;
        }
        match self.nodes.get_mut(id.0).map(|node| &mut node.data) {
            Some(NodeData::Start {
                element, modified, ..
            }) => {
                element.set_attribute(name, value);
                *modified = true;
                true
            }
            _ => false,
        }
    }

    /// Removes an element along with its contents
    pub fn delete_element(&mut self, id: ElementId) -> bool {
        if id.0 < self.flushed {
            return false;
        }
        let end = match self.nodes.get(id.0).map(|node| &node.data) {
            Some(NodeData::Start { end, .. }) => end.unwrap_or(id.0),
            _ => return false,
        };
        for node in &mut self.nodes[id.0..=end] {
            node.deleted = true;
        }
        true
    }

    /// Checks whether an element has been deleted
    pub fn is_deleted(&self, id: ElementId) -> bool {
        self.nodes.get(id.0).is_some_and(|node| node.deleted)
    }

    /// Serializes all nodes added since the last flush
    pub(crate) fn flush(&mut self) -> String {
        let mut result = String::new();
        for node in &self.nodes[self.flushed..] {
            if node.deleted {
                continue;
            }
            match &node.data {
                NodeData::Text(text) | NodeData::Raw(text) | NodeData::End(text) => {
                    result.push_str(text)
                }
                NodeData::Start {
                    element,
                    source,
                    modified,
                    ..
                } => {
                    if *modified {
                        result.push_str(&element.to_html());
                    } else {
                        result.push_str(source);
                    }
                }
            }
        }
        self.flushed = self.nodes.len();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html::lexer::Lexer;

    fn document(html: &str) -> (HtmlDocument, Vec<Added>) {
        let mut lexer = Lexer::default();
        let mut document = HtmlDocument::new();
        let mut added = Vec::new();
        for token in lexer.feed(html).into_iter().chain(lexer.finish()) {
            added.push(document.push(token));
        }
        (document, added)
    }

    #[test]
    fn unchanged_document_round_trips() {
        let html = concat!(
            "<!DOCTYPE html><html><head><link rel=stylesheet href=a.css></head>",
            "<body><p>x</body></html>"
        );
        let (mut document, _) = document(html);
        assert_eq!(document.flush(), html);
        assert_eq!(document.flush(), "");
    }

    #[test]
    fn mutations() {
        let (mut document, added) =
            document("<div><link href=a.css><script src=x.js>1</script>text</div>");
        let Added::Start(link) = added[1] else {
            panic!("unexpected {:?}", added[1]);
        };
        let Added::Start(script) = added[2] else {
            panic!("unexpected {:?}", added[2]);
        };
        assert_eq!(document.element(link).unwrap().attribute("href"), Some("a.css"));
        assert!(document.set_attribute(link, "href", "b.css"));
        assert!(document.delete_element(script));
        assert!(document.is_deleted(script));
        assert_eq!(document.flush(), r#"<div><link href="b.css">text</div>"#);
        assert!(document.element(link).is_none());
        assert!(!document.set_attribute(link, "href", "c.css"));
    }

    #[test]
    fn deleting_open_element() {
        let mut lexer = Lexer::default();
        let mut document = HtmlDocument::new();
        let mut start = None;
        for token in lexer.feed("<p>a<span>b") {
            if let Added::Start(id) = document.push(token) {
                start.get_or_insert(id);
            }
        }
        assert!(document.delete_element(start.unwrap()));
        for token in lexer.feed("</span></p>c") {
            document.push(token);
        }
        assert_eq!(document.flush(), "c");
    }

    #[test]
    fn end_tags_match_start_tags() {
        let (_, added) = document("<div><p>a</div>");
        assert_eq!(added[3], Added::End(Some(ElementId(0))));
        let (_, added) = document("</p>");
        assert_eq!(added[0], Added::End(None));
    }
}
