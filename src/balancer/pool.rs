// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upstream lists per selector.
//!
//! The whole map is swapped atomically; a request always balances over one
//! consistent list even while config pushes or health reports land.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::LoadBalancerRegistry;
use crate::core::{GatewayError, LoadBalanceKey, Upstream};
use crate::{debug_fmt, info_fmt};

type UpstreamMap = HashMap<String, Arc<Vec<Upstream>>>;

#[derive(Debug)]
pub struct UpstreamPool {
    upstreams: ArcSwap<UpstreamMap>,
    balancers: LoadBalancerRegistry,
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new(LoadBalancerRegistry::with_defaults())
    }
}

impl UpstreamPool {
    pub fn new(balancers: LoadBalancerRegistry) -> Self {
        Self {
            upstreams: ArcSwap::from_pointee(HashMap::new()),
            balancers,
        }
    }

    pub fn balancers(&self) -> &LoadBalancerRegistry {
        &self.balancers
    }

    /// Replace the upstream list of `selector_id`.  An empty list removes it.
    pub fn upsert(&self, selector_id: &str, upstreams: Vec<Upstream>) {
        if upstreams.is_empty() {
            self.remove(selector_id);
            return;
        }
        let count = upstreams.len();
        let list = Arc::new(upstreams);
        self.upstreams.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(selector_id.to_string(), list.clone());
            next
        });
        debug_fmt!("UpstreamPool", "selector {} now has {} upstream(s)", selector_id, count);
    }

    /// Drop `selector_id` and any strategy state kept for it.
    pub fn remove(&self, selector_id: &str) -> bool {
        let mut removed = false;
        self.upstreams.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(selector_id).is_some();
            next
        });
        self.balancers.forget(selector_id);
        removed
    }

    /// Mark every entry with `url` healthy or unhealthy.  Returns the
    /// number of entries whose status actually changed.
    pub fn report_status(&self, url: &str, healthy: bool) -> usize {
        let mut changed = 0;
        self.upstreams.rcu(|current| {
            changed = 0;
            let mut next = (**current).clone();
            for list in next.values_mut() {
                if !list.iter().any(|u| u.url == url && u.status != healthy) {
                    continue;
                }
                let updated: Vec<Upstream> = list
                    .iter()
                    .map(|u| {
                        if u.url == url && u.status != healthy {
                            changed += 1;
                            u.clone().with_status(healthy)
                        } else {
                            u.clone()
                        }
                    })
                    .collect();
                *list = Arc::new(updated);
            }
            next
        });
        if changed > 0 {
            info_fmt!(
                "UpstreamPool",
                "upstream {} marked {}",
                url,
                if healthy { "healthy" } else { "unhealthy" }
            );
        }
        changed
    }

    pub fn upstreams_for(&self, selector_id: &str) -> Arc<Vec<Upstream>> {
        self.upstreams
            .load()
            .get(selector_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Current map of selector id to upstream list.
    pub fn snapshot(&self) -> Arc<UpstreamMap> {
        self.upstreams.load_full()
    }

    /// Distinct upstreams across all selectors, by url.
    pub fn distinct_upstreams(&self) -> Vec<Upstream> {
        let snapshot = self.upstreams.load();
        let mut seen = HashMap::new();
        for upstream in snapshot.values().flat_map(|list| list.iter()) {
            seen.entry(upstream.url.clone())
                .or_insert_with(|| upstream.clone());
        }
        let mut upstreams: Vec<Upstream> = seen.into_values().collect();
        upstreams.sort_by(|a, b| a.url.cmp(&b.url));
        upstreams
    }

    /// Pick one healthy upstream for `selector_id` using `key.strategy`.
    pub fn choose(
        &self,
        selector_id: &str,
        key: &LoadBalanceKey,
    ) -> Result<Upstream, GatewayError> {
        let list = self.upstreams_for(selector_id);
        let healthy: Vec<Upstream> = list.iter().filter(|u| u.is_healthy()).cloned().collect();
        if healthy.is_empty() {
            return Err(GatewayError::NoUpstreamAvailable {
                selector_id: selector_id.to_string(),
            });
        }

        let balancer = self
            .balancers
            .get(&key.strategy)
            .ok_or_else(|| GatewayError::NoUpstreamAvailable {
                selector_id: selector_id.to_string(),
            })?;

        balancer
            .choose(&healthy, key)
            .ok_or_else(|| GatewayError::NoUpstreamAvailable {
                selector_id: selector_id.to_string(),
            })
    }
}
