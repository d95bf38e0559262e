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

//! Support for filters combining multiple inputs into a single output

use bytes::{Bytes, BytesMut};
use log::trace;
use url::Url;

use crate::content_type::ContentType;
use crate::filter::PartitionPlan;
use crate::namer::{directory_of, relative_url};
use crate::resource::Resource;

/// Result of offering a resource to the combiner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddResult {
    /// Whether the resource became part of the current partition
    pub added: bool,
    /// Why the resource was rejected
    pub reason: String,
}

impl AddResult {
    fn added() -> Self {
        Self {
            added: true,
            reason: String::new(),
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            added: false,
            reason: reason.into(),
        }
    }
}

/// Groups resources into partitions whose combined output stays within size limits
#[derive(Debug)]
pub struct ResourceCombiner {
    max_bytes: u64,
    max_segment: usize,
    content_type: Option<ContentType>,
    base: Option<Url>,
    current: Vec<usize>,
    bytes: u64,
    segment: usize,
    partitions: Vec<PartitionPlan>,
}

impl ResourceCombiner {
    /// Creates a combiner producing outputs of at most `max_bytes` bytes whose URL name
    /// segment stays below `max_segment` characters.
    pub fn new(max_bytes: u64, max_segment: usize) -> Self {
        Self {
            max_bytes,
            max_segment,
            content_type: None,
            base: None,
            current: Vec::new(),
            bytes: 0,
            segment: 0,
            partitions: Vec::new(),
        }
    }

    /// Number of resources in the current partition
    pub fn pending(&self) -> usize {
        self.current.len()
    }

    /// Offers input `index` for the current partition
    pub fn add(&mut self, index: usize, resource: &Resource) -> AddResult {
        if !resource.is_loaded() {
            return AddResult::rejected("not loaded");
        }
        let Some(content_type) = resource.content_type() else {
            return AddResult::rejected("unknown content type");
        };
        if self
            .content_type
            .as_ref()
            .is_some_and(|current| current.mime() != content_type.mime())
        {
            return AddResult::rejected(format!(
                "content type {} differs from {}",
                content_type.mime(),
                self.content_type
                    .as_ref()
                    .map(ContentType::mime)
                    .unwrap_or_default()
            ));
        }

        let size = u64::try_from(resource.contents().len()).unwrap_or(u64::MAX);
        if self.bytes.saturating_add(size) > self.max_bytes {
            return AddResult::rejected("combined size limit exceeded");
        }

        let Ok(url) = Url::parse(resource.url()) else {
            return AddResult::rejected("invalid URL");
        };
        let base = self.base.clone().unwrap_or_else(|| directory_of(&url));
        let segment = relative_url(&base, resource.url()).len() + 1;
        if self.segment + segment > self.max_segment {
            return AddResult::rejected("URL segment too long");
        }

        self.current.push(index);
        self.bytes += size;
        self.segment += segment;
        self.base = Some(base);
        self.content_type = Some(content_type.clone());
        AddResult::added()
    }

    /// Closes the current partition and starts a new one
    pub fn finish_partition(&mut self) {
        if !self.current.is_empty() {
            trace!("closing combined partition of {} inputs", self.current.len());
            self.partitions
                .push(PartitionPlan::new(std::mem::take(&mut self.current)));
        }
        self.content_type = None;
        self.base = None;
        self.bytes = 0;
        self.segment = 0;
    }

    /// Partitions the inputs: each is added to the current partition, a rejected input closes
    /// it and is offered to the next one. Partitions with a single input are dropped, there is
    /// nothing to combine.
    pub fn partition(mut self, inputs: &[Resource]) -> Vec<PartitionPlan> {
        for (index, input) in inputs.iter().enumerate() {
            let result = self.add(index, input);
            if !result.added {
                trace!("combiner rejected {}: {}", input.url(), result.reason);
                self.finish_partition();
                let retry = self.add(index, input);
                if !retry.added {
                    trace!("{} cannot be combined: {}", input.url(), retry.reason);
                }
            }
        }
        self.finish_partition();
        self.partitions
            .into_iter()
            .filter(|partition| partition.inputs.len() > 1)
            .collect()
    }

    /// Concatenates input contents, putting `separator` between inputs that don't already end
    /// with it.
    pub fn combine(inputs: &[Resource], separator: &str) -> Bytes {
        let mut result = BytesMut::new();
        for input in inputs {
            if !result.is_empty() && !result.ends_with(separator.as_bytes()) {
                result.extend_from_slice(separator.as_bytes());
            }
            result.extend_from_slice(input.contents());
        }
        result.freeze()
    }
}
