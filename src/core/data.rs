// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration data pushed by the control plane.
//!
//! All types deserialize from the camelCase JSON the sync collaborators
//! deliver.  Handles stay raw JSON text until the owning plugin parses them.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::ConfigError;
use crate::router::CompiledOperator;

/// Configuration groups delivered by synchronization collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigGroup {
    Plugin,
    Selector,
    Rule,
    MetaData,
    AppAuth,
}

impl fmt::Display for ConfigGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigGroup::Plugin => "PLUGIN",
            ConfigGroup::Selector => "SELECTOR",
            ConfigGroup::Rule => "RULE",
            ConfigGroup::MetaData => "META_DATA",
            ConfigGroup::AppAuth => "APP_AUTH",
        };
        f.write_str(name)
    }
}

/// How the conditions of a selector or rule combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    And,
    Or,
}

/// Whether a selector inspects its conditions at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectorType {
    /// Matches every request; conditions are ignored
    FullFlow,
    #[default]
    Custom,
}

/// Where a condition reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Uri,
    Query,
    Header,
    Host,
    Ip,
    Cookie,
    Method,
}

/// A plugin's identity and its opaque configuration blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginData {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Position in the chain (ascending)
    #[serde(default, alias = "order")]
    pub sort: i32,
    #[serde(default)]
    pub enabled: bool,
    /// Plugin-specific configuration, interpreted by the plugin itself
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// A single match condition.  Immutable after creation; the compiled form
/// of the operator is built lazily on first use and cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionData {
    pub param_type: ParamType,
    pub operator: String,
    #[serde(default)]
    pub param_name: String,
    #[serde(default)]
    pub param_value: String,
    #[serde(skip)]
    pub(crate) compiled: OnceCell<CompiledOperator>,
}

impl ConditionData {
    pub fn new(param_type: ParamType, operator: &str, param_name: &str, param_value: &str) -> Self {
        Self {
            param_type,
            operator: operator.to_string(),
            param_name: param_name.to_string(),
            param_value: param_value.to_string(),
            compiled: OnceCell::new(),
        }
    }
}

/// Scopes a plugin to matching requests and carries its handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorData {
    pub id: String,
    pub plugin_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default, rename = "type")]
    pub selector_type: SelectorType,
    #[serde(default)]
    pub sort: i32,
    #[serde(default)]
    pub enabled: bool,
    /// Whether a later selector may be tried when this one's rules all fail
    #[serde(default)]
    pub continued: bool,
    #[serde(default)]
    pub conditions: Vec<ConditionData>,
    #[serde(default, deserialize_with = "deserialize_handle")]
    pub handle: Option<String>,
}

/// Finer-grained match below a selector, carrying behaviour parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleData {
    pub id: String,
    pub selector_id: String,
    #[serde(default)]
    pub plugin_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub sort: i32,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<ConditionData>,
    #[serde(default, deserialize_with = "deserialize_handle")]
    pub handle: Option<String>,
}

/// Registered service metadata, used to classify requests by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub context_path: Option<String>,
    pub path: String,
    pub rpc_type: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub method_name: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Credentials an application signs its requests with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAuthData {
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub enabled: bool,
    /// When set, only the listed paths may be called with this key
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// One backend instance with health and weight metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    #[serde(alias = "upstreamUrl")]
    pub url: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// `true` is healthy
    #[serde(default = "default_status")]
    pub status: bool,
    /// Start-up time in epoch milliseconds
    #[serde(default)]
    pub timestamp: u64,
    /// Warm-up period in milliseconds
    #[serde(default)]
    pub warmup: u64,
}

fn default_protocol() -> String {
    "http://".to_string()
}

fn default_weight() -> u32 {
    50
}

fn default_status() -> bool {
    true
}

impl Upstream {
    /// Healthy upstream with the default protocol and weight.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            protocol: default_protocol(),
            weight: default_weight(),
            status: true,
            timestamp: 0,
            warmup: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_status(mut self, healthy: bool) -> Self {
        self.status = healthy;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status
    }

    /// `protocol` + `url`, e.g. `http://10.0.0.1:8080`.
    pub fn domain(&self) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("{}{}", self.protocol, self.url)
        }
    }

    /// Weight after warm-up ramping.  During warm-up the weight grows
    /// linearly with uptime and never drops below one.
    pub fn effective_weight(&self, now_ms: u64) -> u32 {
        if self.weight == 0 || self.warmup == 0 || self.timestamp == 0 {
            return self.weight;
        }
        let uptime = now_ms.saturating_sub(self.timestamp);
        if uptime >= self.warmup {
            return self.weight;
        }
        let ramped = (uptime as f64 / self.warmup as f64) * self.weight as f64;
        (ramped as u32).clamp(1, self.weight)
    }
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Accept a handle delivered either as a JSON string or as inline JSON.
fn deserialize_handle<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Parse a raw handle into its typed form.  An absent handle yields the
/// type's default.
pub fn parse_handle<T>(handle: Option<&str>) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match handle {
        None => Ok(T::default()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ConfigError::ParseError(format!("invalid handle '{raw}': {e}"))),
    }
}

/// Check that a handle, if present, is well-formed JSON.
pub(crate) fn validate_handle(handle: Option<&str>) -> Result<(), ConfigError> {
    if let Some(raw) = handle {
        serde_json::from_str::<serde_json::Value>(raw)
            .map_err(|e| ConfigError::ParseError(format!("unparseable handle JSON: {e}")))?;
    }
    Ok(())
}
