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

//! A minimal HTML event model. Documents are tokenized, filters observe element events and
//! rendering mutates the elements before they are flushed.

mod document;
mod lexer;

pub use document::{ElementId, HtmlDocument};
pub use lexer::{Attribute, Element};

pub(crate) use document::Added;
pub(crate) use lexer::{Lexer, Token};
