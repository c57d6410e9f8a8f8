// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP load balancing.
//!
//! The selector handle is the upstream list; the rule handle picks the
//! strategy plus timeout and retry budget of the outbound call.  Requests
//! without a matching selector or rule are rejected.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{PluginOutcome, SelectorRulePlugin};
use crate::balancer::{DEFAULT_STRATEGY, UpstreamPool};
use crate::cache::subscriber::DataHandler;
use crate::core::data::parse_handle;
use crate::core::{GatewayError, LoadBalanceKey, RuleData, SelectorData, ServerExchange, Upstream};
use crate::{debug_fmt, error_fmt};

/// Rule handle of the divide plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivideRuleHandle {
    #[serde(default = "default_load_balance")]
    pub load_balance: String,
    /// Milliseconds; `None` uses the client default
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry: Option<u32>,
}

fn default_load_balance() -> String {
    DEFAULT_STRATEGY.to_string()
}

impl Default for DivideRuleHandle {
    fn default() -> Self {
        Self {
            load_balance: default_load_balance(),
            timeout: None,
            retry: None,
        }
    }
}

#[derive(Debug)]
pub struct DividePlugin {
    pool: Arc<UpstreamPool>,
}

impl DividePlugin {
    pub fn new(pool: Arc<UpstreamPool>) -> Self {
        Self { pool }
    }

    /// Keeps the upstream pool in line with the divide selectors.
    pub fn data_handler(&self) -> Arc<dyn DataHandler> {
        Arc::new(DivideDataHandler {
            pool: self.pool.clone(),
        })
    }
}

#[async_trait]
impl SelectorRulePlugin for DividePlugin {
    fn name(&self) -> &str {
        "divide"
    }

    fn order(&self) -> i32 {
        200
    }

    fn skip(&self, exchange: &ServerExchange) -> bool {
        !exchange.context.rpc_type.is_plain_http()
    }

    fn on_selector_missing(
        &self,
        _exchange: &mut ServerExchange,
    ) -> Result<PluginOutcome, GatewayError> {
        Err(GatewayError::NoSelector {
            plugin: self.name().to_string(),
        })
    }

    fn on_rule_missing(
        &self,
        _exchange: &mut ServerExchange,
        selector: &SelectorData,
    ) -> Result<PluginOutcome, GatewayError> {
        Err(GatewayError::NoRule {
            plugin: self.name().to_string(),
            selector_id: selector.id.clone(),
        })
    }

    async fn execute_matched(
        &self,
        exchange: &mut ServerExchange,
        selector: &SelectorData,
        rule: &RuleData,
    ) -> Result<PluginOutcome, GatewayError> {
        let handle: DivideRuleHandle = parse_handle(rule.handle.as_deref())?;

        let key = LoadBalanceKey::new(exchange.client_ip(), &selector.id, &handle.load_balance);
        let upstream = self.pool.choose(&selector.id, &key)?;
        debug_fmt!(
            "DividePlugin",
            "{} -> {} via {}",
            exchange.context.path,
            upstream.url,
            handle.load_balance
        );

        let context = &mut exchange.context;
        context.http_domain = Some(upstream.domain());
        context.upstream = Some(upstream);
        if handle.timeout.is_some() {
            context.timeout_ms = handle.timeout;
        }
        if handle.retry.is_some() {
            context.retry = handle.retry;
        }
        Ok(PluginOutcome::Continue)
    }
}

#[derive(Debug)]
struct DivideDataHandler {
    pool: Arc<UpstreamPool>,
}

impl DataHandler for DivideDataHandler {
    fn plugin_name(&self) -> &str {
        "divide"
    }

    fn handle_selector(&self, selector: &SelectorData) {
        match parse_handle::<Vec<Upstream>>(selector.handle.as_deref()) {
            Ok(upstreams) => self.pool.upsert(&selector.id, upstreams),
            Err(e) => error_fmt!(
                "DividePlugin",
                "selector '{}' has an unusable upstream list: {}",
                selector.id,
                e
            ),
        }
    }

    fn remove_selector(&self, selector: &SelectorData) {
        self.pool.remove(&selector.id);
    }
}
