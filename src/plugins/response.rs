// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use reqwest::header::HeaderName;

use super::{Plugin, PluginOutcome};
use crate::core::{GatewayError, GatewayResponse, ServerExchange};
use crate::{trace_fmt, warn_fmt};

/// Connection-scoped headers that never cross the gateway.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Final stage: prepares the upstream response for the transport, or
/// answers with an error when no upstream call produced one.
#[derive(Debug, Default)]
pub struct ResponsePlugin;

#[async_trait]
impl Plugin for ResponsePlugin {
    fn name(&self) -> &str {
        "response"
    }

    fn order(&self) -> i32 {
        420
    }

    async fn execute(&self, exchange: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
        let rpc_type = exchange.context.rpc_type;
        let Some(response) = exchange.upstream_response.as_mut() else {
            if !rpc_type.is_plain_http() {
                warn_fmt!("ResponsePlugin", "no invoker for rpc type {}", rpc_type);
                return Ok(PluginOutcome::Respond(GatewayResponse::error(
                    501,
                    &format!("rpc type '{rpc_type}' is not supported"),
                )));
            }
            return Ok(PluginOutcome::Respond(GatewayResponse::error(
                500,
                "service result error",
            )));
        };

        for name in HOP_BY_HOP {
            response.headers.remove(HeaderName::from_static(name));
        }
        trace_fmt!(
            "ResponsePlugin",
            "{} answered {} ({:?})",
            exchange.context.path,
            response.status,
            exchange.context.result_type
        );
        Ok(PluginOutcome::Continue)
    }
}
