// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the [`RequestContext`](crate::core::RequestContext) at chain entry.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Plugin, PluginOutcome};
use crate::cache::ConfigCache;
use crate::core::{GatewayError, MetaData, ProxyRequest, RequestContext, RpcType, ServerExchange};
use crate::{trace_fmt, warn_fmt};

pub const APP_KEY_HEADER: &str = "appKey";
pub const SIGN_HEADER: &str = "sign";
pub const TIMESTAMP_HEADER: &str = "timestamp";
pub const RPC_TYPE_HEADER: &str = "rpc_type";

/// Fills the protocol-specific parts of the context for one rpc type.
pub trait ContextDecorator: Send + Sync + Debug {
    fn rpc_type(&self) -> RpcType;

    fn decorate(&self, context: &mut RequestContext, meta_data: Option<&MetaData>);
}

/// Plain HTTP style requests: the whole path is forwarded as is.
#[derive(Debug)]
struct HttpDecorator(RpcType);

impl ContextDecorator for HttpDecorator {
    fn rpc_type(&self) -> RpcType {
        self.0
    }

    fn decorate(&self, context: &mut RequestContext, _meta_data: Option<&MetaData>) {
        context.rpc_type = self.0;
        context.method = Some(context.path.clone());
        context.real_url = context.path.clone();
        context.module = Some(format!("divide-{}", self.0));
    }
}

/// RPC style requests: module and method come from the registered metadata
/// and the context path is stripped from the real URL.
#[derive(Debug)]
struct MetaDataDecorator(RpcType);

impl ContextDecorator for MetaDataDecorator {
    fn rpc_type(&self) -> RpcType {
        self.0
    }

    fn decorate(&self, context: &mut RequestContext, meta_data: Option<&MetaData>) {
        context.rpc_type = self.0;
        let Some(meta) = meta_data else {
            context.real_url = context.path.clone();
            return;
        };
        context.module = Some(meta.app_name.clone());
        context.method = Some(meta.method_name.clone());
        context.context_path = meta.context_path.clone();
        context.real_url = match meta.context_path.as_deref() {
            Some(prefix) if !prefix.is_empty() => context
                .path
                .strip_prefix(prefix)
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .map(|rest| if rest.is_empty() { "/".to_string() } else { rest.to_string() })
                .unwrap_or_else(|| context.path.clone()),
            _ => context.path.clone(),
        };
    }
}

/// Decorators by rpc type, resolved once at start-up.
#[derive(Debug, Clone)]
pub struct DecoratorRegistry {
    decorators: HashMap<RpcType, Arc<dyn ContextDecorator>>,
}

impl Default for DecoratorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl DecoratorRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            decorators: HashMap::new(),
        };
        for rpc_type in [RpcType::Http, RpcType::SpringCloud, RpcType::WebSocket] {
            registry.register(Arc::new(HttpDecorator(rpc_type)));
        }
        for rpc_type in [
            RpcType::Dubbo,
            RpcType::Sofa,
            RpcType::Tars,
            RpcType::Motan,
            RpcType::Grpc,
        ] {
            registry.register(Arc::new(MetaDataDecorator(rpc_type)));
        }
        registry
    }

    pub fn register(&mut self, decorator: Arc<dyn ContextDecorator>) {
        self.decorators.insert(decorator.rpc_type(), decorator);
    }

    pub fn get(&self, rpc_type: RpcType) -> Option<&Arc<dyn ContextDecorator>> {
        self.decorators.get(&rpc_type)
    }
}

/// Rpc type of a request and the enabled metadata that decided it, if any.
///
/// Metadata registered for the path wins, then a websocket upgrade, then
/// the `rpc_type` header, then plain HTTP.
pub fn classify_rpc_type(
    request: &ProxyRequest,
    cache: &ConfigCache,
) -> (RpcType, Option<Arc<MetaData>>) {
    if let Some(meta) = cache.meta_data_for(&request.path).filter(|m| m.enabled) {
        match meta.rpc_type.parse() {
            Ok(rpc_type) => return (rpc_type, Some(meta)),
            Err(e) => warn_fmt!("GlobalPlugin", "metadata '{}': {}", meta.id, e),
        }
    }

    if request
        .header("upgrade")
        .is_some_and(|u| u.eq_ignore_ascii_case("websocket"))
    {
        return (RpcType::WebSocket, None);
    }

    match request.header(RPC_TYPE_HEADER).filter(|h| !h.is_empty()) {
        Some(raw) => match raw.parse() {
            Ok(rpc_type) => (rpc_type, None),
            Err(_) => {
                warn_fmt!("GlobalPlugin", "ignoring unknown rpc_type header '{}'", raw);
                (RpcType::Http, None)
            }
        },
        None => (RpcType::Http, None),
    }
}

#[derive(Debug)]
pub struct GlobalPlugin {
    cache: Arc<ConfigCache>,
    decorators: DecoratorRegistry,
}

impl GlobalPlugin {
    pub fn new(cache: Arc<ConfigCache>, decorators: DecoratorRegistry) -> Self {
        Self { cache, decorators }
    }
}

#[async_trait]
impl Plugin for GlobalPlugin {
    fn name(&self) -> &str {
        "global"
    }

    fn order(&self) -> i32 {
        10
    }

    async fn execute(&self, exchange: &mut ServerExchange) -> Result<PluginOutcome, GatewayError> {
        let (rpc_type, meta_data) = classify_rpc_type(&exchange.request, &self.cache);

        let request = &exchange.request;
        let context = &mut exchange.context;
        context.path = request.path.clone();
        context.app_key = request.header(APP_KEY_HEADER).map(str::to_string);
        context.sign = request.header(SIGN_HEADER).map(str::to_string);
        context.timestamp = request.header(TIMESTAMP_HEADER).map(str::to_string);

        let decorator = self
            .decorators
            .get(rpc_type)
            .or_else(|| self.decorators.get(RpcType::Http));
        match decorator {
            Some(decorator) => decorator.decorate(context, meta_data.as_deref()),
            None => {
                context.rpc_type = rpc_type;
                context.real_url = context.path.clone();
            }
        }
        context.meta_data = meta_data;

        trace_fmt!(
            "GlobalPlugin",
            "{} classified as {} (real url {})",
            context.path,
            context.rpc_type,
            context.real_url
        );
        Ok(PluginOutcome::Continue)
    }
}
