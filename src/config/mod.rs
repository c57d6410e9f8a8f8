// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vireo configuration subsystem
//!
//! A running gateway reads its settings from an ordered list of
//! [`ConfigProvider`]s; providers added later override the ones before them:
//!
//! 1. `FileConfigProvider` – `vireo.{toml,json,yaml}`
//! 2. `EnvConfigProvider`  – `VIREO_GATEWAY__HTTP_CLIENT__TIMEOUT_MS=5000`
//! 3. any custom provider implementing [`ConfigProvider`]
//!
//! First-class keys:
//!
//! | key | type | default | description |
//! |-----|------|---------|-------------|
//! | `server.host`                        | string | `127.0.0.1` | Bind address of the gateway listener |
//! | `server.port`                        | u16    | `9195`      | Gateway port |
//! | `server.health_port`                 | u16    | `8081`      | Health/readiness port |
//! | `gateway.logging`                    | table  | –           | See [`crate::logging::config::LoggingConfig`] |
//! | `gateway.http_client.timeout_ms`     | u64    | `3000`      | Default outbound timeout |
//! | `gateway.http_client.connect_timeout_ms` | u64 | `1000`     | Bound on establishing a connection |
//! | `gateway.http_client.retry`          | u32    | `0`         | Default connect-timeout retries |
//! | `gateway.http_client.backoff_base_ms`| u64    | `200`       | First backoff delay |
//! | `gateway.http_client.backoff_max_ms` | u64    | `20000`     | Backoff cap |
//! | `gateway.matcher.fallthrough`        | string | `first_match` | `first_match` or `continued` |
//! | `gateway.health_check.*`             | table  | disabled    | TCP probing of upstreams |
//! | `gateway.data.*`                     | arrays | empty       | Static plugins/selectors/rules applied at start-up |

mod env;
pub mod error;
mod file;
pub mod gateway;


pub use env::EnvConfigProvider;
pub use error::ConfigError;
pub use file::{FileConfigProvider, FileFormat};
pub use gateway::{
    GatewaySettings, HealthCheckSettings, HttpClientSettings, MatcherSettings, ServerSettings,
    StaticData,
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// A source of configuration values.  Object safe; typed access lives on
/// [`ConfigProviderExt`] and [`Config`].
pub trait ConfigProvider: Debug + Send + Sync {
    /// Whether the provider knows the dotted key.
    fn has(&self, key: &str) -> bool;

    /// Name used in diagnostics.
    fn provider_name(&self) -> &str;

    /// Raw JSON value for the dotted key.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError>;
}

/// Typed access on top of any [`ConfigProvider`].
pub trait ConfigProviderExt: ConfigProvider {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_raw(key)?.map(|value| decode(key, value)).transpose()
    }
}

impl<T: ConfigProvider> ConfigProviderExt for T {}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ConfigError> {
    serde_json::from_value(value)
        .map_err(|e| ConfigError::ParseError(format!("failed to deserialize '{key}': {e}")))
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider; it takes precedence over every provider added before.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Append an already shared provider.
    pub fn with_shared_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// The providers added so far, lowest precedence first.
    pub fn into_providers(self) -> Vec<Arc<dyn ConfigProvider>> {
        self.providers
    }

    pub fn build(self) -> Config {
        Config {
            providers: self.providers,
        }
    }
}

/// Layered configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        // Later providers win.
        for provider in self.providers.iter().rev() {
            if provider.has(key) {
                return provider.get_raw(key);
            }
        }
        Ok(None)
    }

    /// Typed value for a dotted key, or `None` when no provider has it.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_raw(key)?.map(|value| decode(key, value)).transpose()
    }

    /// Typed value for a dotted key with a fallback.
    pub fn get_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Names of the configured providers, lowest precedence first.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.provider_name().to_string())
            .collect()
    }

    /// Configuration backed by a single file.
    pub fn default_file(file_path: &str) -> Result<Self, ConfigError> {
        let provider = FileConfigProvider::new(file_path)?;
        Ok(Self::builder().with_provider(provider).build())
    }

    /// Resolve every first-class gateway key into typed settings.
    pub fn gateway_settings(&self) -> Result<GatewaySettings, ConfigError> {
        GatewaySettings::from_config(self)
    }
}
