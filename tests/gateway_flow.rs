// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requests through the fully assembled plugin chain against mock upstreams.

mod common;

use std::time::Duration;

use serde_json::json;
use vireo::{ConfigGroup, DataSubscriber};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{body_text, divide_route, gateway_with_data, get};

#[tokio::test]
async fn test_request_is_proxied_to_the_selected_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("orders page 2"))
        .expect(1)
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({"loadBalance": "roundRobin"}));
    let gateway = gateway_with_data(json!({"selectors": [selector], "rules": [rule]})).await;

    let response = gateway.core().handle(get("/api/orders?page=2")).await;
    assert_eq!(response.status, 200);
    assert_eq!(body_text(response).await, "orders page 2");
}

#[tokio::test]
async fn test_unmatched_request_never_reaches_an_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let gateway = gateway_with_data(json!({"selectors": [selector], "rules": [rule]})).await;

    let response = gateway.core().handle(get("/web/index.html")).await;
    assert_eq!(response.status, 404);
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["code"], 404);
}

#[tokio::test]
async fn test_upstream_error_status_is_passed_through() {
    let upstream = MockServer::start().await;
    Mock::given(path("/api/broken"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad upstream"))
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let gateway = gateway_with_data(json!({"selectors": [selector], "rules": [rule]})).await;

    let response = gateway.core().handle(get("/api/broken")).await;
    assert_eq!(response.status, 502);
    assert_eq!(body_text(response).await, "bad upstream");
}

#[tokio::test]
async fn test_rewrite_changes_the_forwarded_path() {
    let upstream = MockServer::start().await;
    Mock::given(path("/orders/7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("rewritten"))
        .expect(1)
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let gateway = gateway_with_data(json!({
        "selectors": [
            selector,
            {"id": "rw", "pluginName": "rewrite", "enabled": true, "type": "full_flow"}
        ],
        "rules": [
            rule,
            {"id": "rw-rule", "selectorId": "rw", "enabled": true,
             "handle": {"regex": "^/api", "replace": ""}}
        ]
    }))
    .await;

    let response = gateway.core().handle(get("/api/orders/7")).await;
    assert_eq!(response.status, 200);
    assert_eq!(body_text(response).await, "rewritten");
}

#[tokio::test]
async fn test_rate_limit_short_circuits_before_the_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(path("/api/limited"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let gateway = gateway_with_data(json!({
        "selectors": [
            selector,
            {"id": "rl", "pluginName": "rate_limiter", "enabled": true, "type": "full_flow"}
        ],
        "rules": [
            rule,
            {"id": "rl-rule", "selectorId": "rl", "enabled": true,
             "handle": {"replenishRate": 0.001, "burstCapacity": 1}}
        ]
    }))
    .await;

    assert_eq!(gateway.core().handle(get("/api/limited")).await.status, 200);
    assert_eq!(gateway.core().handle(get("/api/limited")).await.status, 429);
}

#[tokio::test]
async fn test_unhealthy_upstreams_yield_503() {
    let upstream = MockServer::start().await;
    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let gateway = gateway_with_data(json!({"selectors": [selector], "rules": [rule]})).await;

    gateway
        .pool()
        .report_status(&upstream.address().to_string(), false);

    let response = gateway.core().handle(get("/api/anything")).await;
    assert_eq!(response.status, 503);
}

#[tokio::test]
async fn test_slow_upstream_times_out_with_504() {
    let upstream = MockServer::start().await;
    Mock::given(path("/api/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({"timeout": 100}));
    let gateway = gateway_with_data(json!({"selectors": [selector], "rules": [rule]})).await;

    let started = std::time::Instant::now();
    let response = gateway.core().handle(get("/api/slow")).await;
    assert_eq!(response.status, 504);
    assert!(started.elapsed() < Duration::from_millis(700));
}

#[tokio::test]
async fn test_config_updates_apply_to_the_next_request() {
    let upstream = MockServer::start().await;
    Mock::given(path("/api/live"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let gateway = gateway_with_data(json!({})).await;
    assert_eq!(gateway.core().handle(get("/api/live")).await.status, 404);

    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let subscriber = gateway.subscriber();
    subscriber.on_upsert(ConfigGroup::Selector, selector);
    subscriber.on_upsert(ConfigGroup::Rule, rule);
    assert_eq!(gateway.core().handle(get("/api/live")).await.status, 200);

    // An empty full sync clears the group and the upstream pool with it.
    subscriber.on_full_sync(ConfigGroup::Selector, Vec::new());
    assert!(gateway.pool().upstreams_for("divide-api").is_empty());
    assert_eq!(gateway.core().handle(get("/api/live")).await.status, 404);
}

#[tokio::test]
async fn test_sign_rejects_unsigned_requests() {
    let upstream = MockServer::start().await;
    Mock::given(path("/api/secure"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let gateway = gateway_with_data(json!({
        "selectors": [
            selector,
            {"id": "sg", "pluginName": "sign", "enabled": true, "type": "full_flow"}
        ],
        "rules": [rule, {"id": "sg-rule", "selectorId": "sg", "enabled": true}],
        "app_auth": [{"appKey": "app-1", "appSecret": "s3cret", "enabled": true}]
    }))
    .await;

    let response = gateway.core().handle(get("/api/secure")).await;
    assert_eq!(response.status, 401);

    let mut signed = get("/api/secure");
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis()
        .to_string();
    signed.headers.insert("appkey", "app-1".parse().unwrap());
    signed.headers.insert("sign", "ignored-digest".parse().unwrap());
    signed.headers.insert("timestamp", now.parse().unwrap());
    assert_eq!(gateway.core().handle(signed).await.status, 200);
}

#[tokio::test]
async fn test_rpc_requests_without_an_invoker_get_501() {
    let gateway = gateway_with_data(json!({
        "meta_data": [{"id": "m1", "path": "/order/find", "rpcType": "dubbo", "enabled": true}]
    }))
    .await;

    let response = gateway.core().handle(get("/order/find")).await;
    assert_eq!(response.status, 501);
}

#[tokio::test]
async fn test_spring_cloud_requests_without_an_invoker_get_501() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let (selector, rule) = divide_route(*upstream.address(), json!({}));
    let gateway = gateway_with_data(json!({
        "selectors": [selector],
        "rules": [rule],
        "meta_data": [{"id": "sc", "path": "/api/sc/find", "rpcType": "springCloud", "enabled": true}]
    }))
    .await;

    let response = gateway.core().handle(get("/api/sc/find")).await;
    assert_eq!(response.status, 501);
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["code"], 501);
}
