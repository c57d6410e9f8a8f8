// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Token bucket rate limiting per rule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{PluginOutcome, SelectorRulePlugin};
use crate::cache::subscriber::DataHandler;
use crate::core::data::parse_handle;
use crate::core::{GatewayError, GatewayResponse, RuleData, SelectorData, ServerExchange};
use crate::{debug_fmt, warn_fmt};

/// How requests are grouped into buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyResolver {
    /// One bucket for every request matching the rule
    #[default]
    #[serde(rename = "WHOLE_KEY_RESOLVER", alias = "whole")]
    Whole,
    /// One bucket per client address
    #[serde(rename = "REMOTE_ADDRESS_KEY_RESOLVER", alias = "remote_address")]
    RemoteAddress,
}

/// Rule handle of the rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterHandle {
    /// Tokens added per second
    #[serde(default = "default_rate", alias = "replenish_rate")]
    pub replenish_rate: f64,
    /// Bucket size
    #[serde(default = "default_capacity", alias = "burst_capacity")]
    pub burst_capacity: f64,
    #[serde(default, alias = "keyResolverName", alias = "key_resolver")]
    pub key_resolver: KeyResolver,
}

fn default_rate() -> f64 {
    1.0
}

fn default_capacity() -> f64 {
    1.0
}

impl Default for RateLimiterHandle {
    fn default() -> Self {
        Self {
            replenish_rate: default_rate(),
            burst_capacity: default_capacity(),
            key_resolver: KeyResolver::Whole,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(rate: f64, capacity: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            rate: rate.max(0.0),
            capacity,
            tokens: capacity,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn matches(&self, handle: &RateLimiterHandle) -> bool {
        self.rate == handle.replenish_rate.max(0.0) && self.capacity == handle.burst_capacity.max(0.0)
    }

    /// Refilled to capacity, so indistinguishable from a new bucket.
    fn is_full_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= self.capacity
    }
}

/// How often idle buckets are swept out.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct BucketStore {
    buckets: HashMap<String, TokenBucket>,
    last_sweep: Instant,
}

impl Default for BucketStore {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }
}

impl BucketStore {
    /// Drop every bucket that has refilled completely.  Returns how many went.
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full_at(now));
        self.last_sweep = now;
        before - self.buckets.len()
    }

    fn sweep_if_due(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        let evicted = self.sweep(now);
        if evicted > 0 {
            debug_fmt!("RateLimiter", "evicted {} idle bucket(s)", evicted);
        }
    }
}

type Buckets = Arc<Mutex<BucketStore>>;

#[derive(Debug, Default)]
pub struct RateLimiterPlugin {
    buckets: Buckets,
}

impl RateLimiterPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).buckets.len()
    }

    pub(crate) fn sweep_idle_at(&self, now: Instant) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).sweep(now)
    }

    /// Drops the buckets of removed or changed rules.
    pub fn data_handler(&self) -> Arc<dyn DataHandler> {
        Arc::new(RateLimiterDataHandler {
            buckets: self.buckets.clone(),
        })
    }

    fn bucket_key(rule: &RuleData, handle: &RateLimiterHandle, exchange: &ServerExchange) -> String {
        match handle.key_resolver {
            KeyResolver::Whole => rule.id.clone(),
            KeyResolver::RemoteAddress => format!("{}:{}", rule.id, exchange.client_ip()),
        }
    }
}

#[async_trait]
impl SelectorRulePlugin for RateLimiterPlugin {
    fn name(&self) -> &str {
        "rate_limiter"
    }

    fn order(&self) -> i32 {
        60
    }

    async fn execute_matched(
        &self,
        exchange: &mut ServerExchange,
        _selector: &SelectorData,
        rule: &RuleData,
    ) -> Result<PluginOutcome, GatewayError> {
        let handle: RateLimiterHandle = parse_handle(rule.handle.as_deref())?;
        let key = Self::bucket_key(rule, &handle, exchange);

        let allowed = {
            let mut store = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            store.sweep_if_due(now);
            let bucket = store
                .buckets
                .entry(key.clone())
                .or_insert_with(|| TokenBucket::new(handle.replenish_rate, handle.burst_capacity));
            if !bucket.matches(&handle) {
                *bucket = TokenBucket::new(handle.replenish_rate, handle.burst_capacity);
            }
            bucket.try_acquire_at(now)
        };

        if allowed {
            Ok(PluginOutcome::Continue)
        } else {
            warn_fmt!("RateLimiter", "bucket '{}' exhausted for {}", key, exchange.context.path);
            Ok(PluginOutcome::Respond(GatewayResponse::error(
                429,
                "You have been restricted, please try again later!",
            )))
        }
    }
}

#[derive(Debug)]
struct RateLimiterDataHandler {
    buckets: Buckets,
}

impl RateLimiterDataHandler {
    fn drop_rule(&self, rule: &RuleData) {
        let prefix = format!("{}:", rule.id);
        let mut store = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        store.buckets.retain(|key, _| key != &rule.id && !key.starts_with(&prefix));
        debug_fmt!("RateLimiter", "dropped buckets of rule '{}'", rule.id);
    }
}

impl DataHandler for RateLimiterDataHandler {
    fn plugin_name(&self) -> &str {
        "rate_limiter"
    }

    fn handle_rule(&self, rule: &RuleData) {
        self.drop_rule(rule);
    }

    fn remove_rule(&self, rule: &RuleData) {
        self.drop_rule(rule);
    }
}
