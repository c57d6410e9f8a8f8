// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upstream pools and load-balancing strategies.
//!
//! | name             | strategy                                           |
//! |------------------|----------------------------------------------------|
//! | `roundRobin`     | per-selector counter over the healthy candidates   |
//! | `random`         | uniform over the healthy candidates                |
//! | `weightedRandom` | probability proportional to (warm-up) weight       |
//! | `hash`           | consistent hash of the client IP over a md5 ring   |
//!
//! Health gating happens in [`UpstreamPool::choose`] before any strategy
//! runs, so a strategy only ever sees healthy candidates.

pub mod health;
mod pool;
mod strategies;


pub use health::UpstreamHealthChecker;
pub use pool::UpstreamPool;
pub use strategies::{
    ConsistentHashBalancer, RandomBalancer, RoundRobinBalancer, WeightedRandomBalancer,
};

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{LoadBalanceKey, Upstream};
use crate::warn_fmt;

/// Strategy used when a rule names none or an unknown one.
pub const DEFAULT_STRATEGY: &str = "weightedRandom";

/// Picks one upstream out of an already health-filtered candidate list.
pub trait LoadBalancer: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// `None` only when `candidates` is empty.
    fn choose(&self, candidates: &[Upstream], key: &LoadBalanceKey) -> Option<Upstream>;

    /// Drop any per-selector state kept for `selector_id`.
    fn forget(&self, _selector_id: &str) {}
}

/// Strategies by name, built once at start-up.
#[derive(Debug, Clone)]
pub struct LoadBalancerRegistry {
    balancers: HashMap<String, Arc<dyn LoadBalancer>>,
}

impl Default for LoadBalancerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LoadBalancerRegistry {
    pub fn empty() -> Self {
        Self {
            balancers: HashMap::new(),
        }
    }

    /// Registry holding the four built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RoundRobinBalancer::new()));
        registry.register(Arc::new(RandomBalancer));
        registry.register(Arc::new(WeightedRandomBalancer));
        registry.register(Arc::new(ConsistentHashBalancer::new()));
        registry
    }

    /// Add or replace a strategy under its own name.
    pub fn register(&mut self, balancer: Arc<dyn LoadBalancer>) {
        self.balancers.insert(balancer.name().to_string(), balancer);
    }

    /// Strategy registered as `name`, falling back to the default one.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LoadBalancer>> {
        if let Some(balancer) = self.balancers.get(name) {
            return Some(balancer.clone());
        }
        if !name.is_empty() {
            warn_fmt!("LoadBalancer", "unknown strategy '{}', using {}", name, DEFAULT_STRATEGY);
        }
        self.balancers.get(DEFAULT_STRATEGY).cloned()
    }

    /// Tell every strategy that `selector_id` is gone.
    pub fn forget(&self, selector_id: &str) {
        for balancer in self.balancers.values() {
            balancer.forget(selector_id);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.balancers.keys().cloned().collect();
        names.sort();
        names
    }
}
