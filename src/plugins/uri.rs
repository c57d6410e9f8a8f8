// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;

use super::{Plugin, PluginOutcome};
use crate::core::{GatewayError, ServerExchange};
use crate::trace_fmt;

/// Builds the final upstream URI: domain, then the rewritten path (or the
/// real URL), then the original query string.
#[derive(Debug, Default)]
pub struct UriPlugin;

#[async_trait]
impl Plugin for UriPlugin {
    fn name(&self) -> &str {
        "uri"
    }

    fn order(&self) -> i32 {
        210
    }

    fn skip(&self, exchange: &ServerExchange) -> bool {
        !exchange.context.rpc_type.is_plain_http()
    }

    async fn execute(&self, exchange: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
        let context = &mut exchange.context;
        let Some(domain) = context.http_domain.as_deref() else {
            return Ok(PluginOutcome::Continue);
        };

        let path = context
            .rewrite_uri
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(&context.real_url);

        let mut uri = format!("{}{}", domain.trim_end_matches('/'), path);
        if let Some(query) = exchange.request.query.as_deref().filter(|q| !q.is_empty()) {
            uri.push('?');
            uri.push_str(query);
        }

        trace_fmt!("UriPlugin", "{} -> {}", context.path, uri);
        context.http_uri = Some(uri);
        Ok(PluginOutcome::Continue)
    }
}
