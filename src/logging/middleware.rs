// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/response logging with trace context for the inbound server.

use hyper::HeaderMap;
use hyper::header::{HeaderName, HeaderValue, USER_AGENT};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::logging::config::LoggingConfig;
use crate::logging::is_structured;
use crate::logging::structured::{RequestInfo, generate_trace_id};

#[derive(Debug, Clone)]
pub struct RequestLogger {
    config: Arc<LoggingConfig>,
}

impl RequestLogger {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Build the request's logging context and log its arrival.
    pub fn start(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
    ) -> RequestInfo {
        let trace_id = if self.config.propagate_trace_id {
            headers
                .get(self.config.trace_id_header.as_str())
                .and_then(|h| h.to_str().ok())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(generate_trace_id)
        } else {
            generate_trace_id()
        };
        let remote = remote_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("unknown");

        let info = RequestInfo::with_trace_id(trace_id, method, path, &remote, user_agent);

        if is_structured() {
            slog::info!(slog_scope::logger(), "Request received";
                "trace_id" => &info.trace_id,
                "method" => &info.method,
                "path" => &info.path,
                "remote_addr" => &info.remote_addr,
                "user_agent" => &info.user_agent,
                "received_at" => info.received_at_rfc3339()
            );
        } else {
            log::debug!(
                "Request received: {} {} from {} (trace_id: {})",
                info.method,
                info.path,
                info.remote_addr,
                info.trace_id
            );
        }
        info
    }

    /// Log completion with the total time of the exchange.
    pub fn finish(&self, info: &RequestInfo, status: u16) {
        let elapsed_ms = info.elapsed_ms();
        if is_structured() {
            slog::info!(slog_scope::logger(), "Response completed";
                "trace_id" => &info.trace_id,
                "method" => &info.method,
                "path" => &info.path,
                "status" => status,
                "elapsed_ms" => elapsed_ms as u64
            );
        } else {
            log::info!(
                "{} {} -> {} in {}ms (trace_id: {})",
                info.method,
                info.path,
                status,
                elapsed_ms,
                info.trace_id
            );
        }
    }

    /// Header echoing the trace id back to the client.
    pub fn trace_header(&self, info: &RequestInfo) -> Option<(HeaderName, HeaderValue)> {
        let name = HeaderName::from_bytes(self.config.trace_id_header.as_bytes()).ok()?;
        let value = HeaderValue::from_str(&info.trace_id).ok()?;
        Some((name, value))
    }
}
