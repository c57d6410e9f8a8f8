// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request signature gate.  The verification itself is delegated to a
//! [`SignVerifier`]; a failed verification answers 401.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use super::{PluginOutcome, SelectorRulePlugin};
use crate::cache::ConfigCache;
use crate::core::data::now_millis;
use crate::core::{GatewayError, GatewayResponse, RuleData, SelectorData, ServerExchange};
use crate::router::CompiledOperator;
use crate::warn_fmt;

/// External signature check.  `Err` carries the reason reported to the
/// client.
#[async_trait]
pub trait SignVerifier: Send + Sync + Debug {
    async fn verify(&self, exchange: &ServerExchange) -> Result<(), String>;
}

/// Checks the credentials side of a signed request: all sign parameters
/// present, timestamp within the allowed window, app key registered and
/// enabled, and the path authorised when the app restricts paths.
#[derive(Debug)]
pub struct AppAuthVerifier {
    cache: Arc<ConfigCache>,
    max_delay_ms: u64,
}

impl AppAuthVerifier {
    pub fn new(cache: Arc<ConfigCache>) -> Self {
        Self {
            cache,
            max_delay_ms: 5 * 60 * 1000,
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }
}

#[async_trait]
impl SignVerifier for AppAuthVerifier {
    async fn verify(&self, exchange: &ServerExchange) -> Result<(), String> {
        let context = &exchange.context;
        let (Some(app_key), Some(_sign), Some(timestamp)) = (
            context.app_key.as_deref().filter(|s| !s.trim().is_empty()),
            context.sign.as_deref().filter(|s| !s.trim().is_empty()),
            context.timestamp.as_deref().filter(|s| !s.trim().is_empty()),
        ) else {
            return Err("sign parameters are incomplete".to_string());
        };

        let sent: u64 = timestamp
            .trim()
            .parse()
            .map_err(|_| format!("invalid timestamp '{timestamp}'"))?;
        if now_millis().abs_diff(sent) > self.max_delay_ms {
            return Err(format!(
                "timestamp outside the allowed window of {} minute(s)",
                self.max_delay_ms / 60_000
            ));
        }

        let auth = self
            .cache
            .app_auth(app_key)
            .filter(|a| a.enabled)
            .ok_or_else(|| "app key does not exist or has been disabled".to_string())?;

        if auth.open {
            let allowed = auth
                .paths
                .iter()
                .any(|p| CompiledOperator::compile("match", p).is_match(&context.path));
            if !allowed {
                return Err("path is not authorised for this app key".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SignPlugin {
    verifier: Arc<dyn SignVerifier>,
}

impl SignPlugin {
    pub fn new(verifier: Arc<dyn SignVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl SelectorRulePlugin for SignPlugin {
    fn name(&self) -> &str {
        "sign"
    }

    fn order(&self) -> i32 {
        20
    }

    async fn execute_matched(
        &self,
        exchange: &mut ServerExchange,
        _selector: &SelectorData,
        _rule: &RuleData,
    ) -> Result<PluginOutcome, GatewayError> {
        match self.verifier.verify(exchange).await {
            Ok(()) => Ok(PluginOutcome::Continue),
            Err(reason) => {
                warn_fmt!("SignPlugin", "rejected {}: {}", exchange.context.path, reason);
                Ok(PluginOutcome::Respond(GatewayResponse::error(401, &reason)))
            }
        }
    }
}
