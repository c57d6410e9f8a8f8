// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The plugin chain engine and the built-in plugins.
//!
//! A request walks the active plugins in ascending order.  Each plugin may
//! be skipped, continue the chain, answer the request itself
//! (short-circuit) or fail.  Once a plugin stops the chain no later plugin
//! runs, and exactly one response leaves [`PluginChain::execute`].
//!
//! Plugins that scope their behaviour with selectors and rules implement
//! [`SelectorRulePlugin`] and are wrapped in a [`MatchingPlugin`], which does
//! the resolution and hands absent matches to the plugin's own callbacks.

mod divide;
mod global;
mod rate_limiter;
mod response;
mod retry;
mod rewrite;
mod sign;
mod uri;
mod web_client;

#[cfg(test)]
mod tests;

pub use divide::{DividePlugin, DivideRuleHandle};
pub use global::{ContextDecorator, DecoratorRegistry, GlobalPlugin, classify_rpc_type};
pub use rate_limiter::{KeyResolver, RateLimiterHandle, RateLimiterPlugin, TokenBucket};
pub use response::ResponsePlugin;
pub use retry::{RetryPolicy, execute_with_retry};
pub use rewrite::{RewriteHandle, RewritePlugin};
pub use sign::{AppAuthVerifier, SignPlugin, SignVerifier};
pub use uri::UriPlugin;
pub use web_client::{
    InvokeError, ReqwestUpstreamClient, UpstreamClient, UpstreamRequest, WebClientPlugin,
};

use std::collections::HashMap;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures_util::FutureExt;
use once_cell::sync::Lazy;

use crate::cache::ConfigCache;
use crate::core::{GatewayError, GatewayResponse, RuleData, SelectorData, ServerExchange};
use crate::router::{MatchResolver, RequestAttributes, Resolution};
use crate::{debug_fmt, error_fmt, info_fmt, trace_fmt};

/// What a plugin wants the engine to do next.
#[derive(Debug)]
pub enum PluginOutcome {
    /// Hand the exchange to the next plugin.
    Continue,
    /// Stop the chain and answer with this response.
    Respond(GatewayResponse),
}

/// A stage of the request pipeline.
#[async_trait]
pub trait Plugin: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Position in the chain when no plugin descriptor overrides it.
    fn order(&self) -> i32;

    /// `true` when this plugin does not apply to the exchange at all.
    fn skip(&self, _exchange: &ServerExchange) -> bool {
        false
    }

    async fn execute(&self, exchange: &mut ServerExchange) -> Result<PluginOutcome, GatewayError>;
}

/// Per-request state of the chain driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Pending,
    Running(usize),
    Completed,
    ShortCircuited,
    Failed,
}

/// Final state and the single response produced for one request.
#[derive(Debug)]
pub struct ChainOutcome {
    pub state: ChainState,
    pub response: GatewayResponse,
    /// Names of the plugins that actually executed, in order.
    pub executed: Vec<String>,
    /// Time spent waiting on the upstream; zero when no call was made.
    pub upstream_elapsed: Duration,
}

/// Ordered, hot-swappable list of plugins.
pub struct PluginChain {
    registered: ArcSwap<Vec<Arc<dyn Plugin>>>,
    active: ArcSwap<Vec<Arc<dyn Plugin>>>,
    /// `(sort, enabled)` per plugin name from the last config snapshot.
    descriptors: ArcSwap<HashMap<String, (i32, bool)>>,
}

impl Debug for PluginChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChain")
            .field("active", &self.names())
            .finish()
    }
}

impl Default for PluginChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let chain = Self {
            registered: ArcSwap::from_pointee(plugins),
            active: ArcSwap::from_pointee(Vec::new()),
            descriptors: ArcSwap::from_pointee(HashMap::new()),
        };
        chain.rebuild();
        chain
    }

    /// Register one more plugin.  A plugin with the same name is replaced.
    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        self.registered.rcu(|current| {
            let mut next: Vec<Arc<dyn Plugin>> = current
                .iter()
                .filter(|p| p.name() != plugin.name())
                .cloned()
                .collect();
            next.push(plugin.clone());
            next
        });
        self.rebuild();
    }

    /// Re-derive the active order from the plugin descriptors in `cache`.
    /// A descriptor's `sort` overrides the plugin's own order; a disabled
    /// descriptor removes the plugin from the chain.  Plugins without a
    /// descriptor keep their default order.
    pub fn reorder(&self, cache: &ConfigCache) {
        let descriptors: HashMap<String, (i32, bool)> = cache
            .plugins()
            .iter()
            .map(|p| (p.name.clone(), (p.sort, p.enabled)))
            .collect();
        self.descriptors.store(Arc::new(descriptors));
        self.rebuild();
    }

    fn rebuild(&self) {
        let descriptors = self.descriptors.load();
        let mut active: Vec<(i32, Arc<dyn Plugin>)> = self
            .registered
            .load()
            .iter()
            .filter_map(|plugin| match descriptors.get(plugin.name()) {
                Some((_, false)) => None,
                Some((sort, true)) => Some((*sort, plugin.clone())),
                None => Some((plugin.order(), plugin.clone())),
            })
            .collect();
        active.sort_by(|(a_order, a), (b_order, b)| {
            a_order.cmp(b_order).then_with(|| a.name().cmp(b.name()))
        });

        let active: Vec<Arc<dyn Plugin>> = active.into_iter().map(|(_, p)| p).collect();
        debug_fmt!(
            "PluginChain",
            "active plugins: {:?}",
            active.iter().map(|p| p.name()).collect::<Vec<_>>()
        );
        self.active.store(Arc::new(active));
    }

    /// Names of the active plugins in execution order.
    pub fn names(&self) -> Vec<String> {
        self.active.load().iter().map(|p| p.name().to_string()).collect()
    }

    /// Drive one exchange through the chain.
    pub async fn execute(&self, mut exchange: ServerExchange) -> ChainOutcome {
        let plugins = self.active.load_full();
        let mut state = ChainState::Pending;
        let mut executed = Vec::new();

        for (index, plugin) in plugins.iter().enumerate() {
            if plugin.skip(&exchange) {
                trace_fmt!("PluginChain", "skipping '{}'", plugin.name());
                continue;
            }
            state = ChainState::Running(index);
            executed.push(plugin.name().to_string());

            let result = AssertUnwindSafe(plugin.execute(&mut exchange))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(PluginOutcome::Continue)) => {}
                Ok(Ok(PluginOutcome::Respond(response))) => {
                    debug_fmt!(
                        "PluginChain",
                        "'{}' answered {} {} with {}",
                        plugin.name(),
                        exchange.request.method,
                        exchange.context.path,
                        response.status
                    );
                    return ChainOutcome {
                        state: ChainState::ShortCircuited,
                        response,
                        executed,
                        upstream_elapsed: exchange.context.upstream_elapsed.unwrap_or_default(),
                    };
                }
                Ok(Err(err)) => {
                    return Self::failed(plugin.name(), &exchange, err, executed);
                }
                Err(_) => {
                    let err = GatewayError::PluginError {
                        plugin: plugin.name().to_string(),
                        message: "plugin panicked".to_string(),
                    };
                    return Self::failed(plugin.name(), &exchange, err, executed);
                }
            }
        }

        let response = match exchange.upstream_response.take() {
            Some(response) => {
                state = ChainState::Completed;
                response
            }
            None => {
                debug_fmt!(
                    "PluginChain",
                    "no plugin produced a response for {} (last state {:?})",
                    exchange.context.path,
                    state
                );
                state = ChainState::Completed;
                GatewayResponse::error(404, "no plugin handled the request")
            }
        };

        ChainOutcome {
            state,
            response,
            executed,
            upstream_elapsed: exchange.context.upstream_elapsed.unwrap_or_default(),
        }
    }

    fn failed(
        plugin: &str,
        exchange: &ServerExchange,
        err: GatewayError,
        executed: Vec<String>,
    ) -> ChainOutcome {
        if err.is_routable() {
            info_fmt!(
                "PluginChain",
                "'{}' rejected {} {}: {}",
                plugin,
                exchange.request.method,
                exchange.context.path,
                err
            );
        } else {
            error_fmt!(
                "PluginChain",
                "'{}' failed on {} {} (selector {:?}, rule {:?}): {}",
                plugin,
                exchange.request.method,
                exchange.context.path,
                exchange.context.selector_id,
                exchange.context.rule_id,
                err
            );
        }
        ChainOutcome {
            state: ChainState::Failed,
            response: GatewayResponse::from_error(&err),
            executed,
            upstream_elapsed: exchange.context.upstream_elapsed.unwrap_or_default(),
        }
    }
}

/// A plugin whose behaviour is scoped by selectors and rules.
#[async_trait]
pub trait SelectorRulePlugin: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn order(&self) -> i32;

    fn skip(&self, _exchange: &ServerExchange) -> bool {
        false
    }

    /// No selector of this plugin matched.  Passes through by default.
    fn on_selector_missing(
        &self,
        _exchange: &mut ServerExchange,
    ) -> Result<PluginOutcome, GatewayError> {
        Ok(PluginOutcome::Continue)
    }

    /// A selector matched but none of its rules did.  Passes through by
    /// default.
    fn on_rule_missing(
        &self,
        _exchange: &mut ServerExchange,
        _selector: &SelectorData,
    ) -> Result<PluginOutcome, GatewayError> {
        Ok(PluginOutcome::Continue)
    }

    async fn execute_matched(
        &self,
        exchange: &mut ServerExchange,
        selector: &SelectorData,
        rule: &RuleData,
    ) -> Result<PluginOutcome, GatewayError>;
}

/// Adapter resolving selector and rule before calling a [`SelectorRulePlugin`].
#[derive(Debug)]
pub struct MatchingPlugin<P> {
    inner: P,
    resolver: Arc<MatchResolver>,
}

impl<P: SelectorRulePlugin> MatchingPlugin<P> {
    pub fn new(inner: P, resolver: Arc<MatchResolver>) -> Self {
        Self { inner, resolver }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: SelectorRulePlugin> Plugin for MatchingPlugin<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn order(&self) -> i32 {
        self.inner.order()
    }

    fn skip(&self, exchange: &ServerExchange) -> bool {
        self.inner.skip(exchange)
    }

    async fn execute(&self, exchange: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
        let attributes = RequestAttributes::from_request(&exchange.request);
        match self.resolver.resolve(self.inner.name(), &attributes) {
            Resolution::NoSelector => {
                trace_fmt!(self.inner.name(), "no selector matched {}", exchange.context.path);
                self.inner.on_selector_missing(exchange)
            }
            Resolution::NoRule(selector) => {
                exchange.context.selector_id = Some(selector.id.clone());
                self.inner.on_rule_missing(exchange, &selector)
            }
            Resolution::Matched { selector, rule } => {
                exchange.context.selector_id = Some(selector.id.clone());
                exchange.context.rule_id = Some(rule.id.clone());
                self.inner.execute_matched(exchange, &selector, &rule).await
            }
        }
    }
}

/// Constructor signature every dynamically registered plugin implements.
pub type PluginConstructor = fn(serde_json::Value) -> Result<Arc<dyn Plugin>, GatewayError>;

static PLUGIN_REGISTRY: Lazy<RwLock<HashMap<String, PluginConstructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a custom plugin under a unique name.  Call this before the
/// gateway is built; the loader instantiates every registered plugin with
/// the `config` of its descriptor (or `null`).
///
/// ```rust
/// use std::sync::Arc;
/// use vireo::core::{GatewayError, ServerExchange};
/// use vireo::plugins::{Plugin, PluginOutcome, register_plugin};
///
/// #[derive(Debug)]
/// struct Stamp;
///
/// #[async_trait::async_trait]
/// impl Plugin for Stamp {
///     fn name(&self) -> &str { "stamp" }
///     fn order(&self) -> i32 { 15 }
///     async fn execute(&self, ex: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
///         ex.context.attributes.insert("stamped".into(), true.into());
///         Ok(PluginOutcome::Continue)
///     }
/// }
///
/// register_plugin("stamp", |_cfg| Ok(Arc::new(Stamp)));
/// ```
pub fn register_plugin(name: &str, ctor: PluginConstructor) {
    PLUGIN_REGISTRY
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name.to_string(), ctor);
}

/// Names of all registered custom plugins, sorted.
pub fn registered_plugins() -> Vec<String> {
    let mut names: Vec<String> = PLUGIN_REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Instantiate a registered custom plugin.
pub fn create_plugin(
    name: &str,
    config: serde_json::Value,
) -> Result<Arc<dyn Plugin>, GatewayError> {
    let ctor = PLUGIN_REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .copied();
    match ctor {
        Some(ctor) => {
            debug_fmt!("PluginRegistry", "creating plugin '{}' with config: {}", name, config);
            ctor(config)
        }
        None => {
            let err = GatewayError::PluginError {
                plugin: name.to_string(),
                message: "no plugin registered under this name".to_string(),
            };
            error_fmt!("PluginRegistry", "{}", err);
            Err(err)
        }
    }
}
