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

//! # Module helpers
//!
//! This crate contains helpers shared by `pagespeed-module` and the server embedding it: the
//! [`RequestFilter`] trait handlers implement, loading of YAML configuration files and standard
//! response pages.

pub mod pingora;
pub mod standard_response;

use async_trait::async_trait;
use log::trace;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::fmt::Debug;
use std::path::Path;

use crate::pingora::{Error, ErrorType, Session};

/// Request filter result indicating how the current request should be processed further
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RequestFilterResult {
    /// Response has been sent, no further processing should happen. Other Pingora phases should
    /// not be triggered.
    ResponseSent,

    /// Request has been handled and further request filters should not run. Response hasn’t been
    /// sent however, next Pingora phase should deal with that.
    Handled,

    /// Request filter could not handle this request, next request filter should run if it exists.
    #[default]
    Unhandled,
}

/// Trait to be implemented by request filters.
#[async_trait]
pub trait RequestFilter {
    /// Configuration type of this handler.
    type Conf;

    /// Creates a new instance of the handler from its configuration.
    fn new(conf: Self::Conf) -> Result<Self, Box<Error>>
    where
        Self: Sized,
        Self::Conf: TryInto<Self, Error = Box<Error>>,
    {
        conf.try_into()
    }

    /// Handles the current request.
    ///
    /// This is essentially identical to the `request_filter` method but is supposed to be called
    /// when there is only a single handler. Consequently, its result can be returned directly.
    async fn handle(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool, Box<Error>>
    where
        Self::CTX: Send,
    {
        let result = self.request_filter(session, ctx).await?;
        Ok(result == RequestFilterResult::ResponseSent)
    }

    /// Per-request state of this handler, see `ProxyHttp::CTX` in Pingora
    type CTX;

    /// Creates a new state object, see `ProxyHttp::new_ctx` in Pingora
    fn new_ctx() -> Self::CTX;

    /// Handler to run during Pingora’s `request_filter` state, see `ProxyHttp::request_filter`.
    /// This uses a different return type to account for the existence of multiple request
    /// filters.
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>>;
}

/// Trait for configuration structures that can be loaded from YAML. This trait has a blanket
/// implementation for any structure implementing [`serde::Deserialize`].
pub trait FromYaml {
    /// Parses configuration from a YAML string.
    fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, Box<Error>>
    where
        Self: Sized;

    /// Loads configuration from a list of YAML files. Top-level settings of later files
    /// override those of earlier ones.
    fn load_from_files<P>(files: &[P]) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
        Self: Sized;
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug,
{
    fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, Box<Error>> {
        let conf = serde_yaml::from_str(yaml.as_ref()).map_err(|err| {
            Error::because(
                ErrorType::ReadError,
                "failed parsing configuration",
                err,
            )
        })?;
        trace!("Parsed configuration: {conf:#?}");
        Ok(conf)
    }

    fn load_from_files<P: AsRef<Path>>(files: &[P]) -> Result<Self, Box<Error>> {
        let mut merged = Mapping::new();
        for file in files {
            let path = file.as_ref();
            let text = std::fs::read_to_string(path).map_err(|err| {
                Error::because(
                    ErrorType::FileOpenError,
                    format!("failed opening configuration file {path:?}"),
                    err,
                )
            })?;
            let value = serde_yaml::from_str(&text).map_err(|err| {
                Error::because(
                    ErrorType::FileReadError,
                    format!("failed reading configuration file {path:?}"),
                    err,
                )
            })?;
            match value {
                Value::Mapping(mapping) => {
                    for (key, value) in mapping {
                        merged.insert(key, value);
                    }
                }
                Value::Null => {}
                _ => {
                    return Err(Error::explain(
                        ErrorType::FileReadError,
                        format!("configuration file {path:?} doesn't contain a mapping"),
                    ))
                }
            }
        }

        let conf = serde_yaml::from_value(Value::Mapping(merged)).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                "failed reading configuration files",
                err,
            )
        })?;
        trace!("Loaded configuration files: {conf:#?}");
        Ok(conf)
    }
}
