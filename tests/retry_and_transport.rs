// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connect-timeout retries and the HTTP listener in front of the chain.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::json;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use vireo::logging::middleware::RequestLogger;
use vireo::config::HttpClientSettings;
use vireo::plugins::{InvokeError, ReqwestUpstreamClient, UpstreamClient, UpstreamRequest};
use vireo::{GatewayResponse, GatewayServer};
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{divide_route, get, loader_with};

/// Fails the first `failures` attempts with a connect timeout.
#[derive(Debug)]
struct FlakyConnectClient {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl UpstreamClient for FlakyConnectClient {
    async fn send(
        &self,
        request: UpstreamRequest,
        _timeout: Duration,
    ) -> Result<GatewayResponse, InvokeError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(InvokeError::ConnectTimeout(format!("{} unreachable", request.url)));
        }
        Ok(GatewayResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: reqwest::Body::from("recovered"),
        })
    }
}

async fn flaky_gateway(failures: usize, retry: u32) -> (vireo::Gateway, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let (selector, rule) = divide_route("10.0.0.1:8080".parse().unwrap(), json!({"retry": retry}));
    let gateway = loader_with(json!({
        "http_client": {"backoff_base_ms": 20, "backoff_max_ms": 1000},
        "data": {"selectors": [selector], "rules": [rule]}
    }))
    .with_upstream_client(Arc::new(FlakyConnectClient {
        failures,
        calls: calls.clone(),
    }))
    .build()
    .await
    .unwrap();
    (gateway, calls)
}

#[tokio::test]
async fn test_connect_timeouts_are_retried_with_backoff() {
    let (gateway, calls) = flaky_gateway(2, 2).await;

    let started = Instant::now();
    let response = gateway.core().handle(get("/api/retry")).await;

    assert_eq!(response.status, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 20ms after the first failure, 40ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_exhausted_retry_budget_yields_504() {
    let (gateway, calls) = flaky_gateway(usize::MAX, 2).await;

    let response = gateway.core().handle(get("/api/retry")).await;

    assert_eq!(response.status, 504);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_no_retry_without_budget() {
    let (gateway, calls) = flaky_gateway(1, 0).await;

    let response = gateway.core().handle(get("/api/retry")).await;

    assert_eq!(response.status, 504);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// A loopback listener that never accepts and whose accept queue is already
/// full, so new connection attempts hang in the handshake.
async fn stalled_listener() -> (TcpListener, Vec<TcpStream>, SocketAddr) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut queued = Vec::new();
    for _ in 0..8 {
        if let Ok(Ok(stream)) =
            tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await
        {
            queued.push(stream);
        }
    }
    (listener, queued, addr)
}

#[tokio::test]
async fn test_stalled_connect_is_a_connect_timeout_even_with_a_short_rule_timeout() {
    let (_listener, _queued, addr) = stalled_listener().await;
    let client = ReqwestUpstreamClient::new(&HttpClientSettings {
        connect_timeout_ms: 1000,
        ..HttpClientSettings::default()
    })
    .unwrap();
    assert_eq!(
        client.connect_budget(Duration::from_millis(150)),
        Duration::from_millis(150)
    );

    let started = Instant::now();
    let result = client
        .send(
            UpstreamRequest {
                method: reqwest::Method::GET,
                url: format!("http://{addr}/api/stalled"),
                headers: HeaderMap::new(),
                body: reqwest::Body::from(""),
            },
            Duration::from_millis(150),
        )
        .await;

    assert!(matches!(result, Err(InvokeError::ConnectTimeout(_))), "{result:?}");
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[tokio::test]
async fn test_stalled_upstream_spends_the_retry_budget() {
    let (_listener, _queued, addr) = stalled_listener().await;
    let (selector, rule) = divide_route(addr, json!({"retry": 2, "timeout": 100}));
    let gateway = loader_with(json!({
        "http_client": {"connect_timeout_ms": 1000, "backoff_base_ms": 20, "backoff_max_ms": 1000},
        "data": {"selectors": [selector], "rules": [rule]}
    }))
    .build()
    .await
    .unwrap();

    let started = Instant::now();
    let response = gateway.core().handle(get("/api/stalled")).await;

    assert_eq!(response.status, 504);
    // Three 100ms connect attempts plus 20ms and 40ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(360));
}

#[tokio::test]
async fn test_listener_streams_request_and_response_bodies() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/items"))
        .and(body_string("{\"name\":\"widget\"}"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let gateway = loader_with(json!({"data": {"selectors": [selector], "rules": [rule]}}))
        .build()
        .await
        .unwrap();

    let server = GatewayServer::new(
        gateway.settings().server.clone(),
        gateway.core().clone(),
        gateway.pool().clone(),
        RequestLogger::new(gateway.settings().logging.clone()),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let serving = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/items"))
        .body("{\"name\":\"widget\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    assert!(response.headers().contains_key("x-trace-id"));
    assert_eq!(response.text().await.unwrap(), "created");

    let response = reqwest::get(format!("http://{addr}/unknown")).await.unwrap();
    assert_eq!(response.status().as_u16(), 404);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
