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

//! Slots: the places in a document referring to resources. Rendering a slot makes the place
//! refer to the slot's current resource.

use log::warn;
use std::collections::VecDeque;

use crate::driver::ContextId;
use crate::html::{ElementId, HtmlDocument};
use crate::resource::ResourceId;

/// Index of a slot within its driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) usize);

/// Where a slot is located
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    /// An attribute of an HTML element
    Html {
        /// The element
        element: ElementId,
        /// Name of the attribute containing the URL
        attribute: String,
    },
    /// A URL within a stylesheet, rendering records the new URL for the stylesheet's filter
    Css,
    /// Input of a reconstruction, there is nothing to render
    Fetch,
    /// Work that happens entirely within the context
    Null,
}

/// Decisions made about a slot by filters and by rewriting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFlags {
    /// Never change the URL in the document
    pub preserve_urls: bool,
    /// Leave the document alone, the result is only used by chained rewrites
    pub disable_rendering: bool,
    /// Remove the element when rendering
    pub delete_element: bool,
    /// Cancel any further rewrites of this slot
    pub disable_further_processing: bool,
    /// The current resource is an optimized version of the original
    pub was_optimized: bool,
}

/// A place referring to a resource
#[derive(Debug)]
pub struct Slot {
    kind: SlotKind,
    resource: ResourceId,
    pub(crate) flags: SlotFlags,
    contexts: VecDeque<ContextId>,
    rendered_url: Option<String>,
}

impl Slot {
    pub(crate) fn new(kind: SlotKind, resource: ResourceId) -> Self {
        Self {
            kind,
            resource,
            flags: SlotFlags::default(),
            contexts: VecDeque::new(),
            rendered_url: None,
        }
    }

    /// Location of the slot
    pub fn kind(&self) -> &SlotKind {
        &self.kind
    }

    /// The resource the slot currently refers to
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub(crate) fn set_resource(&mut self, resource: ResourceId) {
        self.resource = resource;
    }

    /// Current decisions about the slot
    pub fn flags(&self) -> SlotFlags {
        self.flags
    }

    /// URL recorded by rendering a stylesheet slot
    pub fn rendered_url(&self) -> Option<&str> {
        self.rendered_url.as_deref()
    }

    /// Whether rendering can change the URL at this location
    pub fn can_render_url(&self) -> bool {
        matches!(self.kind, SlotKind::Html { .. } | SlotKind::Css)
    }

    /// Attaches a context, returns the context attached previously which becomes the new
    /// context's predecessor.
    pub(crate) fn attach(&mut self, context: ContextId) -> Option<ContextId> {
        let predecessor = self.contexts.back().copied();
        self.contexts.push_back(context);
        predecessor
    }

    /// Detaches a context, which has to be the first or the last one attached.
    pub(crate) fn detach(&mut self, context: ContextId) {
        if self.contexts.front() == Some(&context) {
            self.contexts.pop_front();
        } else if self.contexts.back() == Some(&context) {
            self.contexts.pop_back();
        } else if self.contexts.contains(&context) {
            warn!("detaching context {context:?} from the middle of a slot");
            self.contexts.retain(|attached| *attached != context);
        }
    }

    /// The context attached last
    pub(crate) fn last_context(&self) -> Option<ContextId> {
        self.contexts.back().copied()
    }

    /// Makes the location refer to `url`. Rendering multiple times has the same effect as
    /// rendering once.
    pub(crate) fn render(&mut self, url: &str, document: &mut HtmlDocument) {
        match &self.kind {
            SlotKind::Html { element, attribute } => {
                if self.flags.delete_element {
                    document.delete_element(*element);
                } else if !self.flags.preserve_urls && !self.flags.disable_rendering {
                    document.set_attribute(*element, attribute, url);
                }
            }
            SlotKind::Css => {
                if !self.flags.preserve_urls && !self.flags.disable_rendering {
                    self.rendered_url = Some(url.to_owned());
                }
            }
            SlotKind::Fetch | SlotKind::Null => {}
        }
    }
}
