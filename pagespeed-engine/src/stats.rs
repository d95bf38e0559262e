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

//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Counters describing what the engine did
        #[derive(Debug, Default)]
        pub struct Statistics {
            $($name: AtomicU64,)*
        }

        impl Statistics {
            $(
                $(#[$doc])*
                pub fn $name(&self) -> u64 {
                    self.$name.load(Ordering::Relaxed)
                }
            )*

            /// Resets all counters
            pub fn clear(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    /// Metadata lookups producing a valid result
    metadata_hits,
    /// Metadata lookups without a usable result
    metadata_misses,
    /// Metadata results confirmed by refetching expired inputs
    metadata_revalidations,
    /// Partitions passed to a filter's rewrite
    rewrites_executed,
    /// Contexts that missed their render deadline
    deadline_exceeded,
    /// Unoptimized inputs served by the reconstruction path
    fallbacks_served,
    /// Rewrites abandoned because of load
    too_busy,
    /// Background refreshes of inputs close to expiry
    freshens,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    MetadataHits,
    MetadataMisses,
    MetadataRevalidations,
    RewritesExecuted,
    DeadlineExceeded,
    FallbacksServed,
    TooBusy,
    Freshens,
}

impl Statistics {
    pub(crate) fn add(&self, counter: Counter) {
        let value = match counter {
            Counter::MetadataHits => &self.metadata_hits,
            Counter::MetadataMisses => &self.metadata_misses,
            Counter::MetadataRevalidations => &self.metadata_revalidations,
            Counter::RewritesExecuted => &self.rewrites_executed,
            Counter::DeadlineExceeded => &self.deadline_exceeded,
            Counter::FallbacksServed => &self.fallbacks_served,
            Counter::TooBusy => &self.too_busy,
            Counter::Freshens => &self.freshens,
        };
        value.fetch_add(1, Ordering::Relaxed);
    }
}
