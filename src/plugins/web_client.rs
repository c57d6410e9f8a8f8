// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The terminal outbound HTTP call.

use std::collections::HashMap;
use std::fmt::Debug;
use std::mem;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use reqwest::header::{HOST, HeaderMap};
use thiserror::Error;

use super::retry::{RetryPolicy, execute_with_retry};
use super::{Plugin, PluginOutcome};
use crate::config::HttpClientSettings;
use crate::core::{GatewayError, GatewayResponse, ResultType, ServerExchange};
use crate::{debug_fmt, info_fmt};

/// Failure of a single outbound attempt.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The TCP connection could not be established in time.  The only
    /// failure that is retried.
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Client(reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// One outbound attempt.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

/// Sends requests to upstreams.  Implementations must classify connect
/// timeouts as [`InvokeError::ConnectTimeout`].
#[async_trait]
pub trait UpstreamClient: Send + Sync + Debug {
    async fn send(
        &self,
        request: UpstreamRequest,
        timeout: Duration,
    ) -> Result<GatewayResponse, InvokeError>;
}

/// [`UpstreamClient`] backed by shared `reqwest` connection pools.
///
/// Connecting gets `min(connect_timeout, timeout)`; the request timeout
/// then bounds the wait for the response on top of that.  A stalled connect
/// therefore always surfaces as [`InvokeError::ConnectTimeout`], however
/// short the rule's timeout.  One pool is kept per distinct connect budget.
#[derive(Debug)]
pub struct ReqwestUpstreamClient {
    connect_timeout: Duration,
    clients: RwLock<HashMap<Duration, reqwest::Client>>,
}

impl ReqwestUpstreamClient {
    pub fn new(settings: &HttpClientSettings) -> Result<Self, GatewayError> {
        let connect_timeout = Duration::from_millis(settings.connect_timeout_ms.max(1));
        let client = Self::build_client(connect_timeout).map_err(GatewayError::ClientError)?;
        Ok(Self {
            connect_timeout,
            clients: RwLock::new(HashMap::from([(connect_timeout, client)])),
        })
    }

    fn build_client(connect_timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
    }

    /// Connect budget for one attempt with the given request timeout.
    pub fn connect_budget(&self, timeout: Duration) -> Duration {
        self.connect_timeout.min(timeout)
    }

    fn client_for(&self, connect: Duration) -> Result<reqwest::Client, InvokeError> {
        if let Some(client) = self
            .clients
            .read()
            .ok()
            .and_then(|clients| clients.get(&connect).cloned())
        {
            return Ok(client);
        }

        let client = Self::build_client(connect).map_err(InvokeError::Client)?;
        if let Ok(mut clients) = self.clients.write() {
            clients.entry(connect).or_insert_with(|| client.clone());
        }
        Ok(client)
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn send(
        &self,
        request: UpstreamRequest,
        timeout: Duration,
    ) -> Result<GatewayResponse, InvokeError> {
        let connect = self.connect_budget(timeout);
        let builder = self
            .client_for(connect)?
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body);

        let resp = tokio::time::timeout(connect + timeout, builder.send())
            .await
            .map_err(|_| InvokeError::Timeout(timeout))?
            .map_err(|e| {
                if e.is_connect() && e.is_timeout() {
                    InvokeError::ConnectTimeout(e.to_string())
                } else if e.is_timeout() {
                    InvokeError::Timeout(timeout)
                } else {
                    InvokeError::Client(e)
                }
            })?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = reqwest::Body::wrap_stream(resp.bytes_stream());
        Ok(GatewayResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Debug)]
pub struct WebClientPlugin {
    client: Arc<dyn UpstreamClient>,
    settings: HttpClientSettings,
    policy: RetryPolicy,
}

impl WebClientPlugin {
    pub fn new(client: Arc<dyn UpstreamClient>, settings: HttpClientSettings) -> Self {
        let policy = RetryPolicy::from_settings(&settings);
        Self {
            client,
            settings,
            policy,
        }
    }

    async fn buffer_body(&self, body: reqwest::Body) -> Result<Bytes, GatewayError> {
        Limited::new(body, self.settings.buffer_limit)
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| GatewayError::Other(format!("cannot buffer request body: {e}")))
    }
}

#[async_trait]
impl Plugin for WebClientPlugin {
    fn name(&self) -> &str {
        "web_client"
    }

    fn order(&self) -> i32 {
        220
    }

    fn skip(&self, exchange: &ServerExchange) -> bool {
        !exchange.context.rpc_type.is_plain_http()
    }

    async fn execute(&self, exchange: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
        let Some(url) = exchange.context.http_uri.clone() else {
            return Ok(PluginOutcome::Respond(GatewayResponse::error(
                500,
                "cannot find the upstream url",
            )));
        };
        let timeout = Duration::from_millis(
            exchange
                .context
                .timeout_ms
                .unwrap_or(self.settings.timeout_ms)
                .max(1),
        );
        let retry = exchange.context.retry.unwrap_or(self.settings.retry);
        info_fmt!("WebClient", "forwarding to {} (retry {})", url, retry);

        let mut headers = exchange.request.headers.clone();
        headers.remove(HOST);
        let method = exchange.request.method.clone();
        let body = mem::replace(&mut exchange.request.body, reqwest::Body::from(""));

        // A replayable copy is only needed when a retry can happen.
        let (mut streaming, buffered) = if retry > 0 {
            (None, Some(self.buffer_body(body).await?))
        } else {
            (Some(body), None)
        };

        let upstream_start = Instant::now();
        let result = execute_with_retry(&self.policy, retry, |attempt| {
            let body = match (&buffered, streaming.take()) {
                (Some(bytes), _) => reqwest::Body::from(bytes.clone()),
                (None, Some(body)) => body,
                (None, None) => reqwest::Body::from(""),
            };
            let request = UpstreamRequest {
                method: method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                body,
            };
            let client = self.client.clone();
            async move {
                if attempt > 0 {
                    debug_fmt!("WebClient", "attempt {} to {}", attempt + 1, request.url);
                }
                client.send(request, timeout).await
            }
        })
        .await;

        exchange.context.upstream_elapsed = Some(upstream_start.elapsed());

        match result {
            Ok(response) => {
                exchange.context.result_type = Some(if (200..300).contains(&response.status) {
                    ResultType::Success
                } else {
                    ResultType::Error
                });
                exchange.upstream_response = Some(response);
                Ok(PluginOutcome::Continue)
            }
            Err(err) => {
                exchange.context.result_type = Some(ResultType::Error);
                Err(err)
            }
        }
    }
}
