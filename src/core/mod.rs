// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core primitives – requests, responses, the per-request context & errors.
//!
//! Everything that physically moves through the plugin chain is defined
//! in this module.  No protocol-level logic lives here; that sits in
//! `server` (IO) and `plugins` (behaviour).

pub mod data;


use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::ConfigCache;
use crate::config::Config;
use crate::plugins::{ChainState, PluginChain};
use crate::{debug_fmt, error_fmt};

pub use data::{
    AppAuthData, ConditionData, ConfigGroup, MatchMode, MetaData, ParamType, PluginData, RuleData,
    SelectorData, SelectorType, Upstream,
};

/// Errors that can occur while a request travels through the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or missing configuration entry
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// No selector of the plugin matched the request
    #[error("no selector matched for plugin '{plugin}'")]
    NoSelector { plugin: String },

    /// A selector matched but none of its rules did
    #[error("no rule matched for plugin '{plugin}' in selector '{selector_id}'")]
    NoRule { plugin: String, selector_id: String },

    /// Every candidate upstream is unhealthy or the pool is empty
    #[error("no available upstream for selector '{selector_id}'")]
    NoUpstreamAvailable { selector_id: String },

    /// Connect timeout on the outbound call, retried until the budget ran out
    #[error("transient upstream failure after {attempts} attempt(s): {message}")]
    TransientIo { attempts: u32, message: String },

    /// Timeout error
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A plugin failed outside of its contract
    #[error("plugin '{plugin}' failed: {message}")]
    PluginError { plugin: String, message: String },

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<crate::config::error::ConfigError> for GatewayError {
    fn from(err: crate::config::error::ConfigError) -> Self {
        GatewayError::ConfigError(err.to_string())
    }
}

impl GatewayError {
    /// The HTTP status the transport layer answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NoSelector { .. } | GatewayError::NoRule { .. } => 404,
            GatewayError::NoUpstreamAvailable { .. } => 503,
            GatewayError::TransientIo { .. } | GatewayError::Timeout(_) => 504,
            GatewayError::ClientError(_) => 502,
            GatewayError::ConfigError(_)
            | GatewayError::PluginError { .. }
            | GatewayError::IoError(_)
            | GatewayError::Other(_) => 500,
        }
    }

    /// Whether the error is an expected routing outcome rather than a fault.
    pub fn is_routable(&self) -> bool {
        matches!(
            self,
            GatewayError::NoSelector { .. }
                | GatewayError::NoRule { .. }
                | GatewayError::NoUpstreamAvailable { .. }
        )
    }
}

/// Backend protocol classification of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RpcType {
    #[default]
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "springCloud")]
    SpringCloud,
    #[serde(rename = "dubbo")]
    Dubbo,
    #[serde(rename = "sofa")]
    Sofa,
    #[serde(rename = "tars")]
    Tars,
    #[serde(rename = "motan")]
    Motan,
    #[serde(rename = "grpc")]
    Grpc,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl RpcType {
    /// Wire name used in headers, metadata and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcType::Http => "http",
            RpcType::SpringCloud => "springCloud",
            RpcType::Dubbo => "dubbo",
            RpcType::Sofa => "sofa",
            RpcType::Tars => "tars",
            RpcType::Motan => "motan",
            RpcType::Grpc => "grpc",
            RpcType::WebSocket => "websocket",
        }
    }

    /// Whether the built-in divide, uri and web_client plugins serve this
    /// type.  Every other type needs a protocol invoker of its own.
    pub fn is_plain_http(&self) -> bool {
        matches!(self, RpcType::Http)
    }
}

impl fmt::Display for RpcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(RpcType::Http),
            "springCloud" => Ok(RpcType::SpringCloud),
            "dubbo" => Ok(RpcType::Dubbo),
            "sofa" => Ok(RpcType::Sofa),
            "tars" => Ok(RpcType::Tars),
            "motan" => Ok(RpcType::Motan),
            "grpc" => Ok(RpcType::Grpc),
            "websocket" => Ok(RpcType::WebSocket),
            other => Err(GatewayError::ConfigError(format!("unknown rpc type: {other}"))),
        }
    }
}

/// Represents an inbound request as decoded by the transport layer.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: reqwest::Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
    /// The original client's IP address
    pub client_ip: Option<String>,
}

impl ProxyRequest {
    /// Build a body-less request, mostly useful for tests and probes.
    pub fn new(method: reqwest::Method, path: &str) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            headers: HeaderMap::new(),
            body: reqwest::Body::from(""),
            client_ip: None,
        }
    }

    /// First value of a header as UTF-8, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Represents the single terminal response handed back to the transport layer.
#[derive(Debug)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

impl GatewayResponse {
    /// Structured JSON error result: `{"code": …, "message": …, "data": null}`.
    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({
            "code": status,
            "message": message,
            "data": serde_json::Value::Null,
        });
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: reqwest::Body::from(body.to_string()),
        }
    }

    /// Render a [`GatewayError`] with its mapped status code.
    pub fn from_error(err: &GatewayError) -> Self {
        match err {
            // Never leak internals of a fatal failure to the client.
            GatewayError::PluginError { .. } | GatewayError::Other(_) | GatewayError::IoError(_) => {
                Self::error(500, "Internal Server Error")
            }
            other => Self::error(other.status_code(), &other.to_string()),
        }
    }
}

/// Outcome of the upstream call as recorded on the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Success,
    Error,
}

/// Per-request state carried through the whole chain.
///
/// Created at chain entry, owned by exactly one in-flight request and dropped
/// at chain exit.  Shared caches are only referenced, never embedded.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub rpc_type: RpcType,
    pub path: String,
    /// Path forwarded to the backend, after decorator rewriting
    pub real_url: String,
    pub context_path: Option<String>,
    pub module: Option<String>,
    pub method: Option<String>,
    pub app_key: Option<String>,
    pub sign: Option<String>,
    pub timestamp: Option<String>,
    pub start_time: Instant,
    pub meta_data: Option<Arc<MetaData>>,
    /// Ids of the selector / rule resolved by the last selector-based plugin
    pub selector_id: Option<String>,
    pub rule_id: Option<String>,
    /// Upstream picked by the load balancer
    pub upstream: Option<Upstream>,
    pub http_domain: Option<String>,
    pub http_uri: Option<String>,
    pub rewrite_uri: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry: Option<u32>,
    pub result_type: Option<ResultType>,
    /// Wall time spent in the outbound call, retries included
    pub upstream_elapsed: Option<Duration>,
    /// Custom attributes that can be set by plugins
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            rpc_type: RpcType::Http,
            path: String::new(),
            real_url: String::new(),
            context_path: None,
            module: None,
            method: None,
            app_key: None,
            sign: None,
            timestamp: None,
            start_time: Instant::now(),
            meta_data: None,
            selector_id: None,
            rule_id: None,
            upstream: None,
            http_domain: None,
            http_uri: None,
            rewrite_uri: None,
            timeout_ms: None,
            retry: None,
            result_type: None,
            upstream_elapsed: None,
            attributes: HashMap::new(),
        }
    }
}

/// Correlates one request's load-balancing decision.
///
/// Built right before the single `choose` call and passed to it explicitly;
/// nothing about it is ambient or bound to a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadBalanceKey {
    pub client_ip: String,
    pub selector_id: String,
    pub strategy: String,
}

impl LoadBalanceKey {
    pub fn new(client_ip: &str, selector_id: &str, strategy: &str) -> Self {
        Self {
            client_ip: client_ip.to_string(),
            selector_id: selector_id.to_string(),
            strategy: strategy.to_string(),
        }
    }
}

/// The request, its context and, once the terminal call happened, the
/// upstream response.  Mutated in place by each plugin.
#[derive(Debug)]
pub struct ServerExchange {
    pub request: ProxyRequest,
    pub context: RequestContext,
    pub upstream_response: Option<GatewayResponse>,
}

impl ServerExchange {
    pub fn new(request: ProxyRequest) -> Self {
        let context = RequestContext {
            path: request.path.clone(),
            real_url: request.path.clone(),
            ..RequestContext::default()
        };
        Self {
            request,
            context,
            upstream_response: None,
        }
    }

    /// Client address or an empty string when the transport did not supply one.
    pub fn client_ip(&self) -> &str {
        self.request.client_ip.as_deref().unwrap_or("")
    }
}

/// Gateway core: configuration, the shared caches and the plugin chain.
#[derive(Debug)]
pub struct GatewayCore {
    /// Configuration for the gateway
    pub config: Arc<Config>,
    /// Latest plugin / selector / rule snapshot
    pub cache: Arc<ConfigCache>,
    /// Ordered plugin chain
    pub chain: Arc<PluginChain>,
}

impl GatewayCore {
    pub fn new(config: Arc<Config>, cache: Arc<ConfigCache>, chain: Arc<PluginChain>) -> Self {
        Self { config, cache, chain }
    }

    /// Process a request through the plugin chain.  Always yields exactly one
    /// response; chain failures are already rendered as error responses.
    pub async fn handle(&self, request: ProxyRequest) -> GatewayResponse {
        let overall_start = Instant::now();
        let method = request.method.clone();
        let path = request.path.clone();

        let exchange = ServerExchange::new(request);
        let outcome = self.chain.execute(exchange).await;

        match outcome.state {
            ChainState::Failed => {
                error_fmt!("Gateway", "{} {} failed inside the plugin chain", method, path);
            }
            state => {
                debug_fmt!("Gateway", "{} {} finished chain in state {:?}", method, path, state);
            }
        }

        let timing = RequestTiming::new(overall_start.elapsed(), outcome.upstream_elapsed);
        log::debug!(
            "[timing] {} {} -> {} | total={:?} upstream={:?} internal={:?}",
            method,
            path,
            outcome.response.status,
            timing.total,
            timing.upstream,
            timing.internal
        );

        outcome.response
    }
}

/// Where one request's wall time went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTiming {
    pub total: Duration,
    pub upstream: Duration,
    /// Everything outside the upstream call
    pub internal: Duration,
}

impl RequestTiming {
    pub fn new(total: Duration, upstream: Duration) -> Self {
        Self {
            total,
            upstream,
            internal: total.saturating_sub(upstream),
        }
    }
}
