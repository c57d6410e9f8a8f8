// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed views over the first-class gateway keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Config, ConfigError};
use crate::logging::config::LoggingConfig;
use crate::router::FallthroughPolicy;

/// Everything the loader needs, resolved in one pass.
#[derive(Debug, Clone, Default)]
pub struct GatewaySettings {
    pub server: ServerSettings,
    pub logging: LoggingConfig,
    pub http_client: HttpClientSettings,
    pub matcher: MatcherSettings,
    pub health_check: HealthCheckSettings,
    pub data: StaticData,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerSettings {
                host: config.get_or_default("server.host", default_host())?,
                port: config.get_or_default("server.port", default_port())?,
                health_port: config.get_or_default("server.health_port", default_health_port())?,
            },
            logging: config.get_or_default("gateway.logging", LoggingConfig::default())?,
            http_client: config
                .get_or_default("gateway.http_client", HttpClientSettings::default())?,
            matcher: config.get_or_default("gateway.matcher", MatcherSettings::default())?,
            health_check: config
                .get_or_default("gateway.health_check", HealthCheckSettings::default())?,
            data: config.get_or_default("gateway.data", StaticData::default())?,
        })
    }
}

/// Listener addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9195
}

fn default_health_port() -> u16 {
    8081
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            health_port: default_health_port(),
        }
    }
}

/// Defaults for the terminal outbound call.  A rule handle may override
/// `timeout_ms` and `retry` per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bound on establishing the TCP connection; only this failure is retried
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub retry: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Largest request body buffered for replay when retries are enabled
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    20_000
}

fn default_buffer_limit() -> usize {
    5 * 1024 * 1024
}

impl Default for HttpClientSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry: 0,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            buffer_limit: default_buffer_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatcherSettings {
    #[serde(default)]
    pub fallthrough: FallthroughPolicy,
}

/// Periodic TCP probing of upstreams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Config data shipped with the settings file, applied as one full sync per
/// group during start-up.  Items stay raw so malformed ones can be skipped
/// individually.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StaticData {
    #[serde(default)]
    pub plugins: Vec<Value>,
    #[serde(default)]
    pub selectors: Vec<Value>,
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub meta_data: Vec<Value>,
    #[serde(default)]
    pub app_auth: Vec<Value>,
}

impl StaticData {
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
            && self.selectors.is_empty()
            && self.rules.is_empty()
            && self.meta_data.is_empty()
            && self.app_auth.is_empty()
    }
}
