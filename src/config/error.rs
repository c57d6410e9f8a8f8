// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for configuration loading and config-data ingestion.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::core::ConfigGroup;

/// Errors raised while reading settings or applying pushed configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The requested configuration key was not found.
    #[error("configuration key not found")]
    NotFound,

    /// A value could not be parsed or deserialized.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// IO failure, e.g. while reading a configuration file.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Failure attributed to a specific provider.
    #[error("provider error: {provider}: {message}")]
    ProviderError { provider: String, message: String },

    /// A pushed config item was rejected and skipped.
    #[error("malformed {group} entry '{id}': {message}")]
    MalformedEntry {
        group: ConfigGroup,
        id: String,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

impl ConfigError {
    pub fn provider_error<P: fmt::Display, M: fmt::Display>(provider: P, message: M) -> Self {
        Self::ProviderError {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    pub fn malformed<M: fmt::Display>(group: ConfigGroup, id: &str, message: M) -> Self {
        Self::MalformedEntry {
            group,
            id: id.to_string(),
            message: message.to_string(),
        }
    }
}
