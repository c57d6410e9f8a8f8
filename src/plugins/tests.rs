// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{Value, json};

use super::*;
use crate::balancer::UpstreamPool;
use crate::cache::subscriber::{CommonDataSubscriber, DataHandler, DataSubscriber};
use crate::cache::{ConfigCache, ConfigItem};
use crate::config::HttpClientSettings;
use crate::core::data::now_millis;
use crate::core::{
    ConfigGroup, GatewayError, GatewayResponse, ProxyRequest, ResultType, RpcType, ServerExchange,
};
use crate::router::{FallthroughPolicy, MatchResolver};

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Continue,
    Respond(u16),
    Fail,
    Panic,
}

#[derive(Debug)]
struct CountingPlugin {
    name: &'static str,
    order: i32,
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
}

impl CountingPlugin {
    fn new(
        name: &'static str,
        order: i32,
        behaviour: Behaviour,
    ) -> (Arc<dyn Plugin>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let plugin: Arc<dyn Plugin> = Arc::new(Self {
            name,
            order,
            behaviour,
            calls: calls.clone(),
        });
        (plugin, calls)
    }
}

#[async_trait]
impl Plugin for CountingPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn skip(&self, exchange: &ServerExchange) -> bool {
        exchange.request.header("x-skip") == Some(self.name)
    }

    async fn execute(&self, exchange: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        exchange
            .context
            .attributes
            .entry("trail".to_string())
            .or_insert_with(|| json!([]))
            .as_array_mut()
            .unwrap()
            .push(json!(self.name));
        match self.behaviour {
            Behaviour::Continue => Ok(PluginOutcome::Continue),
            Behaviour::Respond(status) => Ok(PluginOutcome::Respond(GatewayResponse::error(
                status,
                "short-circuited",
            ))),
            Behaviour::Fail => Err(GatewayError::PluginError {
                plugin: self.name.to_string(),
                message: "boom".to_string(),
            }),
            Behaviour::Panic => panic!("plugin blew up"),
        }
    }
}

fn exchange(path: &str) -> ServerExchange {
    let mut request = ProxyRequest::new(Method::GET, path);
    request.client_ip = Some("10.0.0.9".to_string());
    ServerExchange::new(request)
}

#[tokio::test]
async fn test_plugins_run_in_ascending_order() {
    let (c, _) = CountingPlugin::new("c", 30, Behaviour::Continue);
    let (a, _) = CountingPlugin::new("a", 10, Behaviour::Continue);
    let (b, _) = CountingPlugin::new("b", 20, Behaviour::Continue);
    let chain = PluginChain::new(vec![c, a, b]);

    assert_eq!(chain.names(), vec!["a", "b", "c"]);
    let outcome = chain.execute(exchange("/x")).await;
    assert_eq!(outcome.executed, vec!["a", "b", "c"]);
    assert_eq!(outcome.state, ChainState::Completed);
    assert_eq!(outcome.response.status, 404);
}

#[tokio::test]
async fn test_short_circuit_stops_later_plugins() {
    for k in 0..4 {
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        let mut counters = Vec::new();
        let names = ["p0", "p1", "p2", "p3"];
        for (i, name) in names.iter().enumerate() {
            let behaviour = if i == k {
                Behaviour::Respond(429)
            } else {
                Behaviour::Continue
            };
            let (plugin, calls) = CountingPlugin::new(name, i as i32 * 10, behaviour);
            plugins.push(plugin);
            counters.push(calls);
        }
        let chain = PluginChain::new(plugins);

        let outcome = chain.execute(exchange("/x")).await;
        assert_eq!(outcome.state, ChainState::ShortCircuited);
        assert_eq!(outcome.response.status, 429);
        for (i, calls) in counters.iter().enumerate() {
            let expected = usize::from(i <= k);
            assert_eq!(calls.load(Ordering::SeqCst), expected, "k={k} plugin {i}");
        }
    }
}

#[tokio::test]
async fn test_skipped_plugin_is_not_executed() {
    let (a, a_calls) = CountingPlugin::new("a", 10, Behaviour::Continue);
    let (b, b_calls) = CountingPlugin::new("b", 20, Behaviour::Continue);
    let chain = PluginChain::new(vec![a, b]);

    let mut ex = exchange("/x");
    ex.request
        .headers
        .insert(HeaderName::from_static("x-skip"), HeaderValue::from_static("a"));
    let outcome = chain.execute(ex).await;

    assert_eq!(outcome.executed, vec!["b"]);
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failure_and_panic_become_internal_errors() {
    for behaviour in [Behaviour::Fail, Behaviour::Panic] {
        let (bad, _) = CountingPlugin::new("bad", 10, behaviour);
        let (after, after_calls) = CountingPlugin::new("after", 20, Behaviour::Continue);
        let chain = PluginChain::new(vec![bad, after]);

        let outcome = chain.execute(exchange("/x")).await;
        assert_eq!(outcome.state, ChainState::Failed);
        assert_eq!(outcome.response.status, 500);
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);

        // The engine stays usable for the next request.
        let again = chain.execute(exchange("/y")).await;
        assert_eq!(again.state, ChainState::Failed);
    }
}

#[tokio::test]
async fn test_reorder_follows_plugin_descriptors() {
    let (a, _) = CountingPlugin::new("a", 10, Behaviour::Continue);
    let (b, _) = CountingPlugin::new("b", 20, Behaviour::Continue);
    let (c, _) = CountingPlugin::new("c", 30, Behaviour::Continue);
    let chain = Arc::new(PluginChain::new(vec![a, b, c]));

    let cache = Arc::new(ConfigCache::new());
    let subscriber = CommonDataSubscriber::new(cache.clone()).with_chain(chain.clone());
    subscriber.on_full_sync(
        ConfigGroup::Plugin,
        vec![
            json!({"name": "a", "sort": 50, "enabled": true}),
            json!({"name": "b", "sort": 5, "enabled": false}),
        ],
    );
    assert_eq!(chain.names(), vec!["c", "a"]);

    subscriber.on_delete(ConfigGroup::Plugin, "b");
    assert_eq!(chain.names(), vec!["b", "c", "a"]);

    let (late, _) = CountingPlugin::new("late", 1, Behaviour::Continue);
    chain.add(late);
    assert_eq!(chain.names(), vec!["late", "b", "c", "a"]);
}

#[tokio::test]
async fn test_upstream_response_is_the_completed_write() {
    #[derive(Debug)]
    struct Answer;

    #[async_trait]
    impl Plugin for Answer {
        fn name(&self) -> &str {
            "answer"
        }
        fn order(&self) -> i32 {
            1
        }
        async fn execute(&self, ex: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
            let mut response = GatewayResponse::error(200, "ok");
            response
                .headers
                .insert(HeaderName::from_static("connection"), HeaderValue::from_static("close"));
            ex.upstream_response = Some(response);
            Ok(PluginOutcome::Continue)
        }
    }

    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(Answer), Arc::new(ResponsePlugin)];
    let chain = PluginChain::new(plugins);
    let outcome = chain.execute(exchange("/x")).await;
    assert_eq!(outcome.state, ChainState::Completed);
    assert_eq!(outcome.response.status, 200);
    assert!(outcome.response.headers.get("connection").is_none());
}

fn sync(cache: &ConfigCache, group: ConfigGroup, items: Vec<Value>) {
    let parsed = items
        .into_iter()
        .map(|raw| ConfigItem::parse(group, raw).unwrap())
        .collect();
    cache.apply_full_sync(group, parsed);
}

fn divide_chain(cache: Arc<ConfigCache>, pool: Arc<UpstreamPool>) -> PluginChain {
    let resolver = Arc::new(MatchResolver::new(cache.clone(), FallthroughPolicy::FirstMatch));
    let plugins: Vec<Arc<dyn Plugin>> = vec![
        Arc::new(GlobalPlugin::new(cache, DecoratorRegistry::with_defaults())),
        Arc::new(MatchingPlugin::new(DividePlugin::new(pool), resolver)),
        Arc::new(UriPlugin),
    ];
    PluginChain::new(plugins)
}

#[tokio::test]
async fn test_divide_fails_closed_without_selector_or_rule() {
    let cache = Arc::new(ConfigCache::new());
    let pool = Arc::new(UpstreamPool::default());
    sync(
        &cache,
        ConfigGroup::Selector,
        vec![json!({
            "id": "s1", "pluginName": "divide", "sort": 1, "enabled": true,
            "conditions": [{"paramType": "uri", "operator": "startsWith", "paramName": "", "paramValue": "/api"}],
        })],
    );
    let chain = divide_chain(cache, pool);

    let outcome = chain.execute(exchange("/web")).await;
    assert_eq!(outcome.state, ChainState::Failed);
    assert_eq!(outcome.response.status, 404);

    let outcome = chain.execute(exchange("/api/users")).await;
    assert_eq!(outcome.state, ChainState::Failed);
    assert_eq!(outcome.response.status, 404);
}

#[tokio::test]
async fn test_divide_picks_upstream_and_builds_uri() {
    let cache = Arc::new(ConfigCache::new());
    let pool = Arc::new(UpstreamPool::default());
    let divide = DividePlugin::new(pool.clone());
    let subscriber = CommonDataSubscriber::new(cache.clone()).with_handler(divide.data_handler());

    subscriber.on_full_sync(
        ConfigGroup::Selector,
        vec![json!({
            "id": "s1", "pluginName": "divide", "sort": 1, "enabled": true, "type": "full_flow",
            "handle": "[{\"upstreamUrl\": \"10.0.0.1:8080\", \"weight\": 50}]",
        })],
    );
    subscriber.on_full_sync(
        ConfigGroup::Rule,
        vec![json!({
            "id": "r1", "selectorId": "s1", "sort": 1, "enabled": true,
            "handle": {"loadBalance": "roundRobin", "timeout": 1500, "retry": 2},
        })],
    );
    assert_eq!(pool.upstreams_for("s1").len(), 1);

    let chain = divide_chain(cache, pool.clone());
    let mut ex = exchange("/api/users?page=2");
    ex.request.query = Some("page=2".to_string());

    // Run the chain manually so the context can be inspected afterwards.
    for plugin in chain.active.load().iter() {
        plugin.execute(&mut ex).await.unwrap();
    }
    assert_eq!(ex.context.selector_id.as_deref(), Some("s1"));
    assert_eq!(ex.context.rule_id.as_deref(), Some("r1"));
    assert_eq!(ex.context.timeout_ms, Some(1500));
    assert_eq!(ex.context.retry, Some(2));
    assert_eq!(
        ex.context.http_uri.as_deref(),
        Some("http://10.0.0.1:8080/api/users?page=2")
    );

    pool.report_status("10.0.0.1:8080", false);
    let outcome = chain.execute(exchange("/api/users")).await;
    assert_eq!(outcome.response.status, 503);
}

#[test]
fn test_classify_rpc_type() {
    let cache = ConfigCache::new();
    sync(
        &cache,
        ConfigGroup::MetaData,
        vec![
            json!({"id": "m1", "path": "/order/find", "rpcType": "dubbo", "enabled": true}),
            json!({"id": "m2", "path": "/order/off", "rpcType": "dubbo", "enabled": false}),
        ],
    );

    let classify = |path: &str, headers: &[(&'static str, &'static str)]| {
        let mut request = ProxyRequest::new(Method::GET, path);
        for (name, value) in headers {
            request
                .headers
                .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        classify_rpc_type(&request, &cache).0
    };

    assert_eq!(classify("/order/find", &[("rpc_type", "grpc")]), RpcType::Dubbo);
    assert_eq!(classify("/order/off", &[]), RpcType::Http);
    assert_eq!(classify("/ws", &[("upgrade", "websocket")]), RpcType::WebSocket);
    assert_eq!(classify("/x", &[("rpc_type", "springCloud")]), RpcType::SpringCloud);
    assert_eq!(classify("/x", &[("rpc_type", "carrier-pigeon")]), RpcType::Http);
}

#[tokio::test]
async fn test_global_plugin_fills_context() {
    let cache = Arc::new(ConfigCache::new());
    sync(
        &cache,
        ConfigGroup::MetaData,
        vec![json!({
            "id": "m1", "appName": "orders", "contextPath": "/order", "path": "/order/find",
            "rpcType": "dubbo", "serviceName": "OrderService", "methodName": "find", "enabled": true,
        })],
    );
    let plugin = GlobalPlugin::new(cache, DecoratorRegistry::with_defaults());

    let mut ex = exchange("/order/find");
    ex.request
        .headers
        .insert(HeaderName::from_static("appkey"), HeaderValue::from_static("key-1"));
    plugin.execute(&mut ex).await.unwrap();

    assert_eq!(ex.context.rpc_type, RpcType::Dubbo);
    assert_eq!(ex.context.app_key.as_deref(), Some("key-1"));
    assert_eq!(ex.context.module.as_deref(), Some("orders"));
    assert_eq!(ex.context.method.as_deref(), Some("find"));
    assert_eq!(ex.context.real_url, "/find");
    assert!(ex.context.meta_data.is_some());

    let mut ex = exchange("/api/users");
    plugin.execute(&mut ex).await.unwrap();
    assert_eq!(ex.context.rpc_type, RpcType::Http);
    assert_eq!(ex.context.module.as_deref(), Some("divide-http"));
    assert_eq!(ex.context.real_url, "/api/users");
}

#[tokio::test]
async fn test_rewrite_and_uri() {
    let plugin = RewritePlugin::new();
    let selector = serde_json::from_value(json!({"id": "s1", "pluginName": "rewrite"})).unwrap();
    let rule = serde_json::from_value(json!({
        "id": "r1", "selectorId": "s1",
        "handle": {"regex": "^/api/(.*)$", "replace": "/v2/$1"},
    }))
    .unwrap();

    let mut ex = exchange("/api/users");
    plugin.execute_matched(&mut ex, &selector, &rule).await.unwrap();
    assert_eq!(ex.context.rewrite_uri.as_deref(), Some("/v2/users"));

    ex.context.http_domain = Some("http://backend:9000/".to_string());
    UriPlugin.execute(&mut ex).await.unwrap();
    assert_eq!(ex.context.http_uri.as_deref(), Some("http://backend:9000/v2/users"));

    let broken = serde_json::from_value(json!({
        "id": "r2", "selectorId": "s1", "handle": {"regex": "(unclosed"},
    }))
    .unwrap();
    let err = plugin
        .execute_matched(&mut exchange("/api"), &selector, &broken)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ConfigError(_)));
}

#[test]
fn test_token_bucket_refills_over_time() {
    let mut bucket = TokenBucket::new(10.0, 2.0);
    let start = Instant::now();
    assert!(bucket.try_acquire_at(start));
    assert!(bucket.try_acquire_at(start));
    assert!(!bucket.try_acquire_at(start));
    assert!(bucket.try_acquire_at(start + Duration::from_millis(150)));
    assert!(!bucket.try_acquire_at(start + Duration::from_millis(150)));
}

#[tokio::test]
async fn test_rate_limiter_rejects_with_429() {
    let plugin = RateLimiterPlugin::new();
    let selector = serde_json::from_value(json!({"id": "s1", "pluginName": "rate_limiter"})).unwrap();
    let rule: crate::core::RuleData = serde_json::from_value(json!({
        "id": "r1", "selectorId": "s1",
        "handle": {"replenishRate": 0.001, "burstCapacity": 2, "keyResolver": "REMOTE_ADDRESS_KEY_RESOLVER"},
    }))
    .unwrap();

    for _ in 0..2 {
        let outcome = plugin.execute_matched(&mut exchange("/x"), &selector, &rule).await.unwrap();
        assert!(matches!(outcome, PluginOutcome::Continue));
    }
    match plugin.execute_matched(&mut exchange("/x"), &selector, &rule).await.unwrap() {
        PluginOutcome::Respond(response) => assert_eq!(response.status, 429),
        other => panic!("unexpected {other:?}"),
    }

    // Another client has its own bucket.
    let mut other = exchange("/x");
    other.request.client_ip = Some("10.9.9.9".to_string());
    let outcome = plugin.execute_matched(&mut other, &selector, &rule).await.unwrap();
    assert!(matches!(outcome, PluginOutcome::Continue));

    // A rule update resets the buckets.
    plugin.data_handler().handle_rule(&rule);
    let outcome = plugin.execute_matched(&mut exchange("/x"), &selector, &rule).await.unwrap();
    assert!(matches!(outcome, PluginOutcome::Continue));
}

#[tokio::test]
async fn test_rate_limiter_evicts_refilled_buckets() {
    let plugin = RateLimiterPlugin::new();
    let selector = serde_json::from_value(json!({"id": "s1", "pluginName": "rate_limiter"})).unwrap();
    let fast: crate::core::RuleData = serde_json::from_value(json!({
        "id": "fast", "selectorId": "s1",
        "handle": {"replenishRate": 1000.0, "burstCapacity": 2, "keyResolver": "REMOTE_ADDRESS_KEY_RESOLVER"},
    }))
    .unwrap();
    let slow: crate::core::RuleData = serde_json::from_value(json!({
        "id": "slow", "selectorId": "s1",
        "handle": {"replenishRate": 0.001, "burstCapacity": 2},
    }))
    .unwrap();

    for i in 0..50 {
        let mut ex = exchange("/x");
        ex.request.client_ip = Some(format!("10.1.0.{i}"));
        plugin.execute_matched(&mut ex, &selector, &fast).await.unwrap();
    }
    plugin.execute_matched(&mut exchange("/x"), &selector, &slow).await.unwrap();
    assert_eq!(plugin.bucket_count(), 51);

    // Client buckets refill within milliseconds; the slow rule's does not.
    assert_eq!(plugin.sweep_idle_at(Instant::now() + Duration::from_secs(1)), 50);
    assert_eq!(plugin.bucket_count(), 1);

    // The surviving bucket kept its state.
    plugin.execute_matched(&mut exchange("/x"), &selector, &slow).await.unwrap();
    match plugin.execute_matched(&mut exchange("/x"), &selector, &slow).await.unwrap() {
        PluginOutcome::Respond(response) => assert_eq!(response.status, 429),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_app_auth_verifier() {
    let cache = Arc::new(ConfigCache::new());
    sync(
        &cache,
        ConfigGroup::AppAuth,
        vec![
            json!({"appKey": "open-key", "appSecret": "s", "enabled": true}),
            json!({"appKey": "scoped", "appSecret": "s", "enabled": true, "open": true, "paths": ["/api/**"]}),
            json!({"appKey": "off", "appSecret": "s", "enabled": false}),
        ],
    );
    let verifier = AppAuthVerifier::new(cache);

    let signed = |key: &str, path: &str, timestamp: u64| {
        let mut ex = exchange(path);
        ex.context.app_key = Some(key.to_string());
        ex.context.sign = Some("sig".to_string());
        ex.context.timestamp = Some(timestamp.to_string());
        ex
    };
    let now = now_millis();

    assert!(verifier.verify(&signed("open-key", "/any", now)).await.is_ok());
    assert!(verifier.verify(&signed("scoped", "/api/users", now)).await.is_ok());
    assert!(verifier.verify(&signed("scoped", "/web", now)).await.is_err());
    assert!(verifier.verify(&signed("off", "/any", now)).await.is_err());
    assert!(verifier.verify(&signed("missing", "/any", now)).await.is_err());
    assert!(verifier
        .verify(&signed("open-key", "/any", now - 10 * 60 * 1000))
        .await
        .is_err());
    assert!(verifier.verify(&exchange("/any")).await.is_err());
}

#[tokio::test]
async fn test_sign_plugin_answers_401() {
    #[derive(Debug)]
    struct Deny;

    #[async_trait]
    impl SignVerifier for Deny {
        async fn verify(&self, _exchange: &ServerExchange) -> Result<(), String> {
            Err("bad signature".to_string())
        }
    }

    let plugin = SignPlugin::new(Arc::new(Deny));
    let selector = serde_json::from_value(json!({"id": "s1", "pluginName": "sign"})).unwrap();
    let rule = serde_json::from_value(json!({"id": "r1", "selectorId": "s1"})).unwrap();
    match plugin.execute_matched(&mut exchange("/x"), &selector, &rule).await.unwrap() {
        PluginOutcome::Respond(response) => assert_eq!(response.status, 401),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_retry_policy_delays_are_capped() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay(0), Duration::from_millis(200));
    assert_eq!(policy.delay(1), Duration::from_millis(400));
    assert_eq!(policy.delay(2), Duration::from_millis(800));
    assert_eq!(policy.delay(10), Duration::from_secs(20));
    assert_eq!(policy.delay(64), Duration::from_secs(20));
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(20),
        max: Duration::from_millis(500),
        factor: 2,
    }
}

#[tokio::test]
async fn test_retry_recovers_after_connect_timeouts() {
    let attempts = AtomicUsize::new(0);
    let policy = fast_policy();
    let start = Instant::now();

    let result = execute_with_retry(&policy, 3, |_| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(InvokeError::ConnectTimeout("connect timed out".to_string()))
            } else {
                Ok("done")
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= policy.delay(0) + policy.delay(1));
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let attempts = AtomicUsize::new(0);
    let result: Result<(), _> = execute_with_retry(&fast_policy(), 2, |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(InvokeError::ConnectTimeout("refused".to_string())) }
    })
    .await;

    assert!(matches!(result, Err(GatewayError::TransientIo { attempts: 3, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_other_failures_are_not_retried() {
    let attempts = AtomicUsize::new(0);
    let result: Result<(), _> = execute_with_retry(&fast_policy(), 5, |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(InvokeError::Timeout(Duration::from_millis(5))) }
    })
    .await;

    assert!(matches!(result, Err(GatewayError::Timeout(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

/// Answers from a script of outcomes and records what it was sent.
#[derive(Debug, Default)]
struct ScriptedClient {
    script: Mutex<VecDeque<Result<u16, InvokeError>>>,
    seen: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl UpstreamClient for ScriptedClient {
    async fn send(
        &self,
        request: UpstreamRequest,
        _timeout: Duration,
    ) -> Result<GatewayResponse, InvokeError> {
        let host = request
            .headers
            .get("host")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        self.seen.lock().unwrap().push((request.url, host));
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(status)) => Ok(GatewayResponse::error(status, "scripted")),
            Some(Err(e)) => Err(e),
            None => Err(InvokeError::Other("script exhausted".to_string())),
        }
    }
}

#[tokio::test]
async fn test_web_client_retries_and_records_result() {
    let client = Arc::new(ScriptedClient::default());
    client.script.lock().unwrap().extend([
        Err(InvokeError::ConnectTimeout("slow".to_string())),
        Ok(502),
    ]);
    let settings = HttpClientSettings {
        backoff_base_ms: 1,
        ..HttpClientSettings::default()
    };
    let plugin = WebClientPlugin::new(client.clone(), settings);

    let mut ex = exchange("/x");
    ex.request
        .headers
        .insert(HeaderName::from_static("host"), HeaderValue::from_static("gateway"));
    ex.request.body = reqwest::Body::from("payload");
    ex.context.http_uri = Some("http://backend/x".to_string());
    ex.context.retry = Some(1);

    let outcome = plugin.execute(&mut ex).await.unwrap();
    assert!(matches!(outcome, PluginOutcome::Continue));
    assert_eq!(ex.upstream_response.as_ref().unwrap().status, 502);
    assert_eq!(ex.context.result_type, Some(ResultType::Error));

    let seen = client.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|(url, host)| url == "http://backend/x" && host.is_none()));
}

#[derive(Debug)]
struct SlowClient(Duration);

#[async_trait]
impl UpstreamClient for SlowClient {
    async fn send(
        &self,
        _request: UpstreamRequest,
        _timeout: Duration,
    ) -> Result<GatewayResponse, InvokeError> {
        tokio::time::sleep(self.0).await;
        Ok(GatewayResponse::error(200, "slow"))
    }
}

#[tokio::test]
async fn test_chain_outcome_reports_upstream_time() {
    #[derive(Debug)]
    struct Target;

    #[async_trait]
    impl Plugin for Target {
        fn name(&self) -> &str {
            "target"
        }
        fn order(&self) -> i32 {
            1
        }
        async fn execute(&self, ex: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
            ex.context.http_uri = Some("http://backend/x".to_string());
            Ok(PluginOutcome::Continue)
        }
    }

    let client = Arc::new(SlowClient(Duration::from_millis(40)));
    let plugins: Vec<Arc<dyn Plugin>> = vec![
        Arc::new(Target),
        Arc::new(WebClientPlugin::new(client, HttpClientSettings::default())),
        Arc::new(ResponsePlugin),
    ];
    let outcome = PluginChain::new(plugins).execute(exchange("/x")).await;
    assert_eq!(outcome.response.status, 200);
    assert!(outcome.upstream_elapsed >= Duration::from_millis(40));

    let (only, _) = CountingPlugin::new("only", 1, Behaviour::Respond(204));
    let outcome = PluginChain::new(vec![only]).execute(exchange("/x")).await;
    assert_eq!(outcome.upstream_elapsed, Duration::ZERO);
}

#[tokio::test]
async fn test_web_client_without_uri_answers_error() {
    let plugin = WebClientPlugin::new(Arc::new(ScriptedClient::default()), HttpClientSettings::default());
    let outcome = plugin.execute(&mut exchange("/x")).await.unwrap();
    assert!(matches!(outcome, PluginOutcome::Respond(ref r) if r.status == 500));

    let mut ex = exchange("/x");
    ex.context.rpc_type = RpcType::Dubbo;
    assert!(plugin.skip(&ex));
    ex.context.rpc_type = RpcType::SpringCloud;
    assert!(plugin.skip(&ex));
    assert!(UriPlugin.skip(&ex));
}

#[test]
#[serial_test::serial]
fn test_registry_creates_registered_plugins() {
    fn build(config: Value) -> Result<Arc<dyn Plugin>, GatewayError> {
        let order = config.get("order").and_then(Value::as_i64).unwrap_or(5) as i32;
        let (plugin, _) = CountingPlugin::new("custom", order, Behaviour::Continue);
        Ok(plugin)
    }

    register_plugin("custom", build);
    assert!(registered_plugins().contains(&"custom".to_string()));

    let plugin = create_plugin("custom", json!({"order": 7})).unwrap();
    assert_eq!(plugin.order(), 7);
    assert!(create_plugin("never-registered", Value::Null).is_err());
}
