// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Built-in load-balancing strategies.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use super::LoadBalancer;
use crate::core::data::now_millis;
use crate::core::{LoadBalanceKey, Upstream};

/// Cycles through the candidates with one counter per selector.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counters: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selectors that currently hold a counter.
    pub fn tracked(&self) -> usize {
        self.counters.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn counter(&self, selector_id: &str) -> Arc<AtomicUsize> {
        if let Some(counter) = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector_id)
        {
            return counter.clone();
        }
        self.counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(selector_id.to_string())
            .or_default()
            .clone()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &str {
        "roundRobin"
    }

    fn choose(&self, candidates: &[Upstream], key: &LoadBalanceKey) -> Option<Upstream> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter(&key.selector_id).fetch_add(1, Ordering::Relaxed);
        candidates.get(index % candidates.len()).cloned()
    }

    fn forget(&self, selector_id: &str) {
        self.counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(selector_id);
    }
}

/// Uniform choice.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn name(&self) -> &str {
        "random"
    }

    fn choose(&self, candidates: &[Upstream], _key: &LoadBalanceKey) -> Option<Upstream> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(index).cloned()
    }
}

/// Random choice weighted by each candidate's effective weight.
#[derive(Debug, Default)]
pub struct WeightedRandomBalancer;

impl LoadBalancer for WeightedRandomBalancer {
    fn name(&self) -> &str {
        "weightedRandom"
    }

    fn choose(&self, candidates: &[Upstream], _key: &LoadBalanceKey) -> Option<Upstream> {
        if candidates.is_empty() {
            return None;
        }
        let now = now_millis();
        let weights: Vec<u64> = candidates
            .iter()
            .map(|u| u64::from(u.effective_weight(now)))
            .collect();
        let total: u64 = weights.iter().sum();

        let mut rng = rand::thread_rng();
        if total == 0 {
            return candidates.get(rng.gen_range(0..candidates.len())).cloned();
        }

        let mut point = rng.gen_range(0..total);
        for (upstream, weight) in candidates.iter().zip(weights) {
            if point < weight {
                return Some(upstream.clone());
            }
            point -= weight;
        }
        candidates.last().cloned()
    }
}

const VIRTUAL_NODES: usize = 160;

/// Ring positions for one candidate membership.
#[derive(Debug)]
struct HashRing {
    signature: String,
    points: BTreeMap<u32, String>,
}

impl HashRing {
    fn build(signature: String, candidates: &[Upstream]) -> Self {
        let mut points = BTreeMap::new();
        for upstream in candidates {
            // Each md5 digest yields four ring positions.
            for replica in 0..VIRTUAL_NODES / 4 {
                let digest = md5::compute(format!("{}-{}", upstream.url, replica));
                for chunk in digest.0.chunks_exact(4) {
                    let position = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.insert(position, upstream.url.clone());
                }
            }
        }
        Self { signature, points }
    }

    fn locate(&self, key: &str) -> Option<&str> {
        let digest = md5::compute(key.as_bytes());
        let hash = u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]]);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, url)| url.as_str())
    }
}

/// Consistent hashing of the client IP over a ring of virtual nodes.  A
/// membership change only remaps the keys on the affected ring segments.
#[derive(Debug, Default)]
pub struct ConsistentHashBalancer {
    rings: RwLock<HashMap<String, Arc<HashRing>>>,
}

impl ConsistentHashBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selectors that currently hold a ring.
    pub fn tracked(&self) -> usize {
        self.rings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn signature(candidates: &[Upstream]) -> String {
        let mut urls: Vec<&str> = candidates.iter().map(|u| u.url.as_str()).collect();
        urls.sort_unstable();
        urls.join(",")
    }

    fn ring(&self, selector_id: &str, candidates: &[Upstream]) -> Arc<HashRing> {
        let signature = Self::signature(candidates);
        if let Some(ring) = self
            .rings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector_id)
            .filter(|r| r.signature == signature)
        {
            return ring.clone();
        }
        let ring = Arc::new(HashRing::build(signature, candidates));
        self.rings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(selector_id.to_string(), ring.clone());
        ring
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    fn name(&self) -> &str {
        "hash"
    }

    fn choose(&self, candidates: &[Upstream], key: &LoadBalanceKey) -> Option<Upstream> {
        if candidates.is_empty() {
            return None;
        }
        let ring = self.ring(&key.selector_id, candidates);
        let url = ring.locate(&key.client_ip)?;
        candidates.iter().find(|u| u.url == url).cloned()
    }

    fn forget(&self, selector_id: &str) {
        self.rings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(selector_id);
    }
}
