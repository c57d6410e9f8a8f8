// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common test utilities and helpers for the gateway integration tests.

use std::net::SocketAddr;

use http_body_util::BodyExt;
use serde_json::{Value, json};
use vireo::config::{ConfigError, ConfigProvider};
use vireo::{Gateway, GatewayLoader, GatewayResponse, ProxyRequest};

/// Config provider over one nested JSON document; dotted keys walk into it.
#[derive(Debug, Clone)]
pub struct JsonConfigProvider {
    root: Value,
}

impl JsonConfigProvider {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        key.split('.').try_fold(&self.root, |node, part| node.get(part))
    }
}

impl ConfigProvider for JsonConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    fn provider_name(&self) -> &str {
        "json-test"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.lookup(key).cloned())
    }
}

/// Enable log output for tests.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A divide selector on `/api` pointing at `upstream`, plus one rule whose
/// handle is `rule_handle`.
#[allow(dead_code)]
pub fn divide_route(upstream: SocketAddr, rule_handle: Value) -> (Value, Value) {
    let selector = json!({
        "id": "divide-api",
        "pluginName": "divide",
        "name": "api",
        "sort": 1,
        "enabled": true,
        "type": "custom",
        "matchMode": "and",
        "conditions": [
            {"paramType": "uri", "operator": "startsWith", "paramName": "", "paramValue": "/api"}
        ],
        "handle": [{"upstreamUrl": upstream.to_string(), "weight": 50}]
    });
    let rule = json!({
        "id": "divide-api-rule",
        "selectorId": "divide-api",
        "pluginName": "divide",
        "sort": 1,
        "enabled": true,
        "conditions": [],
        "handle": rule_handle
    });
    (selector, rule)
}

/// Loader over the given `gateway` settings table.
pub fn loader_with(gateway: Value) -> GatewayLoader {
    init_test_logging();
    Gateway::loader().with_provider(JsonConfigProvider::new(json!({
        "server": {"host": "127.0.0.1", "port": 0, "health_port": 0},
        "gateway": gateway
    })))
}

/// Build a gateway over the given `gateway.data`.
#[allow(dead_code)]
pub async fn gateway_with_data(data: Value) -> Gateway {
    loader_with(json!({ "data": data }))
        .build()
        .await
        .expect("gateway builds")
}

#[allow(dead_code)]
pub fn get(path_and_query: &str) -> ProxyRequest {
    let mut request = ProxyRequest::new(reqwest::Method::GET, path_and_query);
    request.client_ip = Some("127.0.0.1".to_string());
    request
}

/// Drain a response body, streamed or buffered.
#[allow(dead_code)]
pub async fn body_text(response: GatewayResponse) -> String {
    let bytes = response
        .body
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}
