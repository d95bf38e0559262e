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

//! Contexts run on behalf of resource requests rather than documents

use http::HeaderMap;
use std::sync::Arc;
use url::Url;

use crate::engine::Engine;
use crate::filter::RewriteFilter;
use crate::resource::Resource;
use crate::slot::SlotKind;
use crate::user_agent::ResourceContext;

use super::{ContextId, DriverState, Mode};

/// What a context produced for a resource request
#[derive(Debug, Clone)]
pub(crate) struct FetchOutcome {
    pub(crate) finished: bool,
    pub(crate) optimizable: bool,
    /// URL of the current output
    pub(crate) url: Option<String>,
    pub(crate) hash: Option<String>,
    /// The output if it was produced by this context, a cached result only refers to it
    pub(crate) output: Option<Resource>,
    /// Inputs as far as they were loaded
    pub(crate) inputs: Vec<Resource>,
}

impl DriverState {
    pub(crate) fn for_fetch(engine: Engine, url: &Url) -> Self {
        Self::new(engine, Mode::Fetch, url.clone(), &HeaderMap::new())
    }

    /// Starts a context for the given inputs. Inputs already loaded by the caller are passed
    /// in `loaded` and won't be fetched again.
    pub(crate) fn initiate_fetch(
        &mut self,
        filter: Arc<dyn RewriteFilter>,
        urls: &[String],
        loaded: Vec<Resource>,
        kind: SlotKind,
        context: ResourceContext,
        force_rewrite: bool,
    ) -> ContextId {
        for resource in loaded {
            self.store_resource(resource);
        }
        let slots = urls
            .iter()
            .map(|url| {
                let resource = self.resources.get_or_create(url);
                self.add_slot(kind.clone(), resource)
            })
            .collect();
        self.initiate_with(filter, slots, context, None, force_rewrite)
    }

    pub(crate) fn fetch_outcome(&self, id: ContextId, urls: &[String]) -> FetchOutcome {
        let ctx = self.context(id);
        let partition = ctx.partitions.partitions.first();
        let output = ctx
            .outputs
            .first()
            .copied()
            .flatten()
            .map(|output| self.resources.get(output))
            .filter(|output| output.is_loaded())
            .cloned();
        let inputs = urls
            .iter()
            .filter_map(|url| self.resources.find(url))
            .map(|input| self.resources.get(input).clone())
            .collect();
        FetchOutcome {
            finished: ctx.is_finished(),
            optimizable: partition.is_some_and(|partition| partition.optimizable),
            url: partition.and_then(|partition| partition.url.clone()),
            hash: partition.and_then(|partition| partition.hash.clone()),
            output,
            inputs,
        }
    }
}
