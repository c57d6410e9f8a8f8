// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vireo - a configuration-driven API gateway core.
//!
//! Every inbound request runs through an ordered chain of plugins.  Each
//! plugin may continue, answer the request itself, or fail; exactly one
//! response leaves the gateway.  Selector/rule based plugins only act on
//! requests whose attributes match one of their selectors and rules, which
//! live in a hot-swappable [`ConfigCache`] fed by a [`DataSubscriber`].
//!
//! # Request flow
//!
//! - `global` classifies the request (http, springCloud, websocket, rpc)
//!   and fills the [`RequestContext`].
//! - `sign`, `rate_limiter` and `rewrite` guard and reshape matching traffic.
//! - `divide` picks an upstream through the [`UpstreamPool`] and its
//!   [`LoadBalancer`] strategies.
//! - `uri` and `web_client` build the target URI and perform the outbound
//!   call with timeout and connect-timeout retry.
//! - `response` finalizes what goes back to the client.
//!
//! # Configuration
//!
//! Settings come from layered [`ConfigProvider`]s: files (JSON, TOML, YAML),
//! environment variables and custom providers.  Plugin, selector and rule
//! data is applied at start-up from `gateway.data` and can be pushed later
//! through [`Gateway::subscriber`].
//!
//! # Custom plugins
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use vireo::{Gateway, GatewayError, Plugin, PluginOutcome, ServerExchange};
//!
//! #[derive(Debug)]
//! struct RequestStamp;
//!
//! #[async_trait]
//! impl Plugin for RequestStamp {
//!     fn name(&self) -> &str {
//!         "request_stamp"
//!     }
//!
//!     fn order(&self) -> i32 {
//!         15
//!     }
//!
//!     async fn execute(&self, exchange: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
//!         exchange.context.attributes.insert("stamped".into(), true.into());
//!         Ok(PluginOutcome::Continue)
//!     }
//! }
//!
//! # async fn run() -> Result<(), vireo::LoaderError> {
//! let gateway = Gateway::loader()
//!     .with_config_file("vireo.toml")
//!     .with_env_vars()
//!     .with_plugin(RequestStamp)
//!     .build()
//!     .await?;
//! gateway.start().await
//! # }
//! ```

// Module declarations
#[macro_use]
pub mod logging;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod core;
pub mod loader;
pub mod plugins;
pub mod router;
pub mod server;

// Re-export key types at the crate root for convenience
pub use balancer::{LoadBalancer, LoadBalancerRegistry, UpstreamHealthChecker, UpstreamPool};
pub use cache::{CommonDataSubscriber, ConfigCache, ConfigItem, DataHandler, DataSubscriber};
pub use config::{Config, ConfigError, ConfigProvider, ConfigProviderExt, GatewaySettings};
pub use core::{
    ConfigGroup, GatewayCore, GatewayError, GatewayResponse, LoadBalanceKey, ProxyRequest,
    RequestContext, RequestTiming, ResultType, RpcType, ServerExchange, Upstream,
};
pub use loader::{Gateway, GatewayLoader, LoaderError};
pub use plugins::{
    ChainOutcome, ChainState, MatchingPlugin, Plugin, PluginChain, PluginOutcome,
    SelectorRulePlugin, create_plugin, register_plugin,
};
pub use router::{FallthroughPolicy, MatchResolver, Resolution};
pub use server::{GatewayServer, HealthServer};
