// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level entry-point – "turn the key and go".
//!
//! The [`GatewayLoader`] consumes configuration, initializes logging,
//! creates the shared caches, assembles the plugin chain and returns a
//! [`Gateway`] whose server is ready to start.


use std::env;
use std::sync::Arc;

use log::LevelFilter;
use serde_json::Value;
use thiserror::Error;

use crate::balancer::{UpstreamHealthChecker, UpstreamPool};
use crate::cache::subscriber::{CommonDataSubscriber, DataSubscriber};
use crate::cache::ConfigCache;
use crate::config::{
    Config, ConfigBuilder, ConfigError, ConfigProvider, EnvConfigProvider, FileConfigProvider,
    GatewaySettings, StaticData,
};
use crate::core::{ConfigGroup, GatewayCore, GatewayError};
use crate::logging::init_with_config;
use crate::logging::middleware::RequestLogger;
use crate::plugins::{
    AppAuthVerifier, DecoratorRegistry, DividePlugin, GlobalPlugin, MatchingPlugin, Plugin,
    PluginChain, RateLimiterPlugin, ReqwestUpstreamClient, ResponsePlugin, RewritePlugin,
    SignPlugin, SignVerifier, UpstreamClient, UriPlugin, WebClientPlugin, create_plugin,
    registered_plugins,
};
use crate::router::MatchResolver;
use crate::server::GatewayServer;
use crate::{info_fmt, warn_fmt};

/// Errors that can occur during gateway initialization.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Gateway error
    #[error("gateway error: {0}")]
    GatewayError(#[from] GatewayError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Builder for initializing and configuring the gateway.
#[derive(Debug, Default)]
pub struct GatewayLoader {
    config: Option<Config>,
    config_builder: ConfigBuilder,
    config_file_path: Option<String>,
    use_env_vars: bool,
    env_prefix: Option<String>,
    custom_plugins: Vec<Arc<dyn Plugin>>,
    upstream_client: Option<Arc<dyn UpstreamClient>>,
    sign_verifier: Option<Arc<dyn SignVerifier>>,
}

impl GatewayLoader {
    /// Create a new loader with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fully built configuration; other config sources are ignored.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a configuration file to load.
    pub fn with_config_file(mut self, file_path: &str) -> Self {
        self.config_file_path = Some(file_path.to_string());
        self
    }

    /// Enable environment variable configuration.
    pub fn with_env_vars(mut self) -> Self {
        self.use_env_vars = true;
        self
    }

    /// Set a custom prefix for environment variables (default is "VIREO_").
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.use_env_vars = true;
        self
    }

    /// Add a custom configuration provider.  Providers override the file
    /// and environment sources and each other in the order they are added.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.config_builder = self.config_builder.with_provider(provider);
        self
    }

    /// Add a plugin instance to the chain.
    pub fn with_plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.custom_plugins.push(Arc::new(plugin));
        self
    }

    /// Replace the HTTP client of the terminal call.
    pub fn with_upstream_client(mut self, client: Arc<dyn UpstreamClient>) -> Self {
        self.upstream_client = Some(client);
        self
    }

    /// Replace the signature check of the sign plugin.
    pub fn with_sign_verifier(mut self, verifier: Arc<dyn SignVerifier>) -> Self {
        self.sign_verifier = Some(verifier);
        self
    }

    fn build_config(&mut self) -> Result<Config, LoaderError> {
        if let Some(config) = self.config.take() {
            return Ok(config);
        }

        let mut builder = Config::builder();
        if let Some(file_path) = &self.config_file_path {
            builder = builder.with_provider(FileConfigProvider::new(file_path)?);
        }
        if self.use_env_vars {
            let env_provider = match &self.env_prefix {
                Some(prefix) => EnvConfigProvider::new(prefix),
                None => EnvConfigProvider::default(),
            };
            builder = builder.with_provider(env_provider);
        }
        for provider in std::mem::take(&mut self.config_builder).into_providers() {
            builder = builder.with_shared_provider(provider);
        }
        Ok(builder.build())
    }

    /// Build and initialize the gateway.
    pub async fn build(mut self) -> Result<Gateway, LoaderError> {
        let config = Arc::new(self.build_config()?);
        let settings = config.gateway_settings()?;

        let log_level = match env::var("RUST_LOG_LEVEL").ok().as_deref() {
            Some("trace") => LevelFilter::Trace,
            Some("debug") => LevelFilter::Debug,
            Some("info") => LevelFilter::Info,
            Some("warn") => LevelFilter::Warn,
            Some("error") => LevelFilter::Error,
            _ => settings.logging.level_filter(),
        };
        init_with_config(log_level, &settings.logging);
        info_fmt!("Startup", "Vireo starting up");

        let cache = Arc::new(ConfigCache::new());
        let pool = Arc::new(UpstreamPool::default());
        let resolver = Arc::new(MatchResolver::new(
            cache.clone(),
            settings.matcher.fallthrough,
        ));

        let sign_verifier = self
            .sign_verifier
            .take()
            .unwrap_or_else(|| Arc::new(AppAuthVerifier::new(cache.clone())));
        let upstream_client: Arc<dyn UpstreamClient> = match self.upstream_client.take() {
            Some(client) => client,
            None => Arc::new(ReqwestUpstreamClient::new(&settings.http_client)?),
        };

        let rate_limiter = RateLimiterPlugin::new();
        let rate_limiter_handler = rate_limiter.data_handler();
        let divide = DividePlugin::new(pool.clone());
        let divide_handler = divide.data_handler();

        let mut plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(GlobalPlugin::new(
                cache.clone(),
                DecoratorRegistry::with_defaults(),
            )),
            Arc::new(MatchingPlugin::new(
                SignPlugin::new(sign_verifier),
                resolver.clone(),
            )),
            Arc::new(MatchingPlugin::new(rate_limiter, resolver.clone())),
            Arc::new(MatchingPlugin::new(RewritePlugin::new(), resolver.clone())),
            Arc::new(MatchingPlugin::new(divide, resolver.clone())),
            Arc::new(UriPlugin),
            Arc::new(WebClientPlugin::new(
                upstream_client,
                settings.http_client.clone(),
            )),
            Arc::new(ResponsePlugin),
        ];

        for name in registered_plugins() {
            let plugin_config = descriptor_config(&settings.data, &name);
            plugins.push(create_plugin(&name, plugin_config)?);
            info_fmt!("Startup", "Added registered plugin: {}", name);
        }
        plugins.append(&mut self.custom_plugins);

        let chain = Arc::new(PluginChain::new(plugins));
        let subscriber = Arc::new(
            CommonDataSubscriber::new(cache.clone())
                .with_handler(divide_handler)
                .with_handler(rate_limiter_handler)
                .with_chain(chain.clone()),
        );

        apply_static_data(subscriber.as_ref(), &settings.data);
        info_fmt!(
            "Startup",
            "Plugin chain: [{}], {} selector(s), {} rule(s)",
            chain.names().join(", "),
            cache.len(ConfigGroup::Selector),
            cache.len(ConfigGroup::Rule)
        );

        let core = Arc::new(GatewayCore::new(config.clone(), cache.clone(), chain));
        let server = GatewayServer::new(
            settings.server.clone(),
            core.clone(),
            pool.clone(),
            RequestLogger::new(settings.logging.clone()),
        );

        Ok(Gateway {
            config,
            settings,
            core,
            pool,
            subscriber,
            server,
        })
    }
}

/// `config` of the plugin's static descriptor, or `null`.
fn descriptor_config(data: &StaticData, name: &str) -> Value {
    data.plugins
        .iter()
        .find(|p| p.get("name").and_then(Value::as_str) == Some(name))
        .and_then(|p| p.get("config"))
        .cloned()
        .unwrap_or(Value::Null)
}

/// One full sync per group.  Selectors go before rules so rule handlers can
/// find their selector's plugin.
fn apply_static_data(subscriber: &dyn DataSubscriber, data: &StaticData) {
    if data.is_empty() {
        warn_fmt!("Startup", "No static configuration data; every request will get a 404");
    }
    subscriber.on_full_sync(ConfigGroup::Plugin, data.plugins.clone());
    subscriber.on_full_sync(ConfigGroup::Selector, data.selectors.clone());
    subscriber.on_full_sync(ConfigGroup::Rule, data.rules.clone());
    subscriber.on_full_sync(ConfigGroup::MetaData, data.meta_data.clone());
    subscriber.on_full_sync(ConfigGroup::AppAuth, data.app_auth.clone());
}

/// An initialized gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    config: Arc<Config>,
    settings: GatewaySettings,
    core: Arc<GatewayCore>,
    pool: Arc<UpstreamPool>,
    subscriber: Arc<CommonDataSubscriber>,
    server: GatewayServer,
}

impl Gateway {
    /// Create a new loader for initializing the gateway.
    pub fn loader() -> GatewayLoader {
        GatewayLoader::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn core(&self) -> &Arc<GatewayCore> {
        &self.core
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.core.cache
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Entry point for synchronization sources pushing config changes.
    pub fn subscriber(&self) -> Arc<CommonDataSubscriber> {
        self.subscriber.clone()
    }

    /// Start the health checker (when enabled) and serve until shutdown.
    pub async fn start(&self) -> Result<(), LoaderError> {
        let health_checker = self.settings.health_check.enabled.then(|| {
            UpstreamHealthChecker::new(self.pool.clone(), &self.settings.health_check).spawn()
        });

        let result = self.server.start().await.map_err(LoaderError::GatewayError);

        if let Some(handle) = health_checker {
            handle.abort();
        }
        result
    }
}
