// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{PluginOutcome, SelectorRulePlugin};
use crate::core::data::parse_handle;
use crate::core::{GatewayError, RuleData, SelectorData, ServerExchange};
use crate::{debug_fmt, error_fmt};

/// Rule handle: `regex` is replaced by `replace` in the real URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteHandle {
    pub regex: String,
    #[serde(default)]
    pub replace: String,
}

/// Regex rewrite of the real URL into the rewrite URI.
#[derive(Debug, Default)]
pub struct RewritePlugin {
    compiled: RwLock<HashMap<String, Arc<Regex>>>,
}

impl RewritePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn regex(&self, pattern: &str) -> Result<Arc<Regex>, GatewayError> {
        if let Some(regex) = self
            .compiled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pattern)
        {
            return Ok(regex.clone());
        }
        let regex = Regex::new(pattern).map(Arc::new).map_err(|e| {
            let err = GatewayError::ConfigError(format!("invalid rewrite regex '{pattern}': {e}"));
            error_fmt!("RewritePlugin", "{}", err);
            err
        })?;
        self.compiled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

#[async_trait]
impl SelectorRulePlugin for RewritePlugin {
    fn name(&self) -> &str {
        "rewrite"
    }

    fn order(&self) -> i32 {
        90
    }

    async fn execute_matched(
        &self,
        exchange: &mut ServerExchange,
        _selector: &SelectorData,
        rule: &RuleData,
    ) -> Result<PluginOutcome, GatewayError> {
        let handle: RewriteHandle = parse_handle(rule.handle.as_deref())?;
        if handle.regex.is_empty() {
            return Ok(PluginOutcome::Continue);
        }

        let regex = self.regex(&handle.regex)?;
        let context = &mut exchange.context;
        let rewritten = regex
            .replace_all(&context.real_url, handle.replace.as_str())
            .into_owned();
        debug_fmt!("RewritePlugin", "rewriting {} to {}", context.real_url, rewritten);
        context.rewrite_uri = Some(rewritten);
        Ok(PluginOutcome::Continue)
    }
}
