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

//! The metadata cache record: how a set of inputs was partitioned and what each partition
//! produced, along with the information needed to decide whether the record is still valid.

use bytes::Bytes;
use pingora_error::{Error, ErrorType};
use serde::{Deserialize, Serialize};

/// How the validity of an input is established on a metadata cache hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// The input came from the HTTP cache, it is valid until its expiration time
    Cache,
    /// The input was read from the filesystem, it is valid as long as its modification time
    /// doesn't change
    File,
    /// The input was not cacheable, records depending on it are never valid
    Uncacheable,
}

/// Revalidation record of a single input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputInfo {
    /// Validation method
    pub kind: InputKind,
    /// Position of the input within the context's slots
    pub index: usize,
    /// Date of the input response
    pub date_ms: i64,
    /// Time at which the input stops being fresh
    pub expiration_ms: i64,
    /// Last modification time of the input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_ms: Option<i64>,
    /// Content hash, present if the rewrite outcome depends on the input's bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// File path for filesystem inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// URL of the input, only recorded for other dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Result of validating an input record against the current time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputValidity {
    Valid,
    /// Expired, might still be confirmed by refetching the input
    Expired,
    Invalid,
}

impl InputInfo {
    /// Validates a record without touching the filesystem. File records are reported as
    /// expired, they have to be confirmed against the file's modification time.
    pub(crate) fn check(&self, now_ms: i64) -> InputValidity {
        match self.kind {
            InputKind::Cache if now_ms < self.expiration_ms => InputValidity::Valid,
            InputKind::Cache | InputKind::File => InputValidity::Expired,
            InputKind::Uncacheable => InputValidity::Invalid,
        }
    }
}

/// Outcome of a single partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    /// Indices of the context's slots that are inputs of this partition
    pub inputs: Vec<usize>,
    /// Revalidation records of the inputs
    pub input_info: Vec<InputInfo>,
    /// Whether an optimized output exists
    pub optimizable: bool,
    /// URL of the output resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Hash of the output contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Output contents for outputs that are inlined rather than referenced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inlined_data: Option<String>,
    /// Additional inputs the outcome depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_dependencies: Vec<InputInfo>,
}

/// All partitions of a context, stored in the metadata cache under the partition key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPartitions {
    /// Record format version
    pub version: u32,
    /// Incremented with each write, lets background refreshes detect concurrent rewrites
    pub generation: u64,
    /// The partitions in order
    pub partitions: Vec<CachedResult>,
    /// Inputs beyond the declared ones the whole result depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_dependencies: Vec<InputInfo>,
}

impl OutputPartitions {
    /// Current record format
    pub const VERSION: u32 = 1;

    /// Creates an empty record
    pub fn new() -> Self {
        Self {
            version: Self::VERSION,
            ..Default::default()
        }
    }

    /// Serializes the record
    pub fn encode(&self) -> Result<Bytes, Box<Error>> {
        serde_json::to_vec(self).map(Bytes::from).map_err(|err| {
            Error::because(
                ErrorType::InternalError,
                "failed serializing output partitions",
                err,
            )
        })
    }

    /// Deserializes a record and checks its consistency for a context with `num_inputs`
    /// inputs. Records that don't pass are reported as errors and should be deleted.
    pub fn decode(data: &[u8], num_inputs: usize) -> Result<Self, Box<Error>> {
        let record: Self = serde_json::from_slice(data).map_err(|err| {
            Error::because(ErrorType::Custom("CacheCorrupt"), "malformed metadata", err)
        })?;

        if record.version != Self::VERSION {
            return Err(Error::explain(
                ErrorType::Custom("CacheCorrupt"),
                format!("unexpected metadata version {}", record.version),
            ));
        }

        for partition in &record.partitions {
            if partition.inputs.iter().any(|index| *index >= num_inputs)
                || partition
                    .input_info
                    .iter()
                    .any(|info| !partition.inputs.contains(&info.index))
            {
                return Err(Error::explain(
                    ErrorType::Custom("CacheCorrupt"),
                    "metadata refers to unknown inputs",
                ));
            }
            if partition.optimizable && (partition.url.is_none() || partition.hash.is_none()) {
                return Err(Error::explain(
                    ErrorType::Custom("CacheCorrupt"),
                    "optimizable partition without output",
                ));
            }
        }
        Ok(record)
    }

    /// All input records the validity of this result depends on
    pub fn all_inputs(&self) -> impl Iterator<Item = &InputInfo> {
        self.partitions
            .iter()
            .flat_map(|partition| {
                partition
                    .input_info
                    .iter()
                    .chain(partition.other_dependencies.iter())
            })
            .chain(self.other_dependencies.iter())
    }

    /// Mutable access to all input records
    pub(crate) fn all_inputs_mut(&mut self) -> impl Iterator<Item = &mut InputInfo> {
        self.partitions
            .iter_mut()
            .flat_map(|partition| {
                partition
                    .input_info
                    .iter_mut()
                    .chain(partition.other_dependencies.iter_mut())
            })
            .chain(self.other_dependencies.iter_mut())
    }

    /// Position of the partition containing a given input
    pub fn partition_for_input(&self, index: usize) -> Option<usize> {
        self.partitions
            .iter()
            .position(|partition| partition.inputs.contains(&index))
    }
}
