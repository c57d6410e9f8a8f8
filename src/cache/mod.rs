// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory configuration cache.
//!
//! Every config group lives in its own immutable snapshot behind an
//! [`ArcSwap`].  Readers load the current snapshot without locking; writers
//! build a new snapshot and swap it in, so a reader never sees a partially
//! applied update.  Single-entry mutations go through `rcu`, which retries
//! on concurrent writers instead of losing an update.

pub mod subscriber;


use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;

use crate::config::ConfigError;
use crate::core::data::validate_handle;
use crate::core::{AppAuthData, ConfigGroup, MetaData, PluginData, RuleData, SelectorData};
use crate::{debug_fmt, warn_fmt};

pub use subscriber::{CommonDataSubscriber, DataHandler, DataSubscriber};

/// One parsed config entry of any group.
#[derive(Debug, Clone)]
pub enum ConfigItem {
    Plugin(PluginData),
    Selector(SelectorData),
    Rule(RuleData),
    MetaData(MetaData),
    AppAuth(AppAuthData),
}

impl ConfigItem {
    /// Parse a raw entry pushed for `group`.  Handles must be valid JSON.
    pub fn parse(group: ConfigGroup, raw: Value) -> Result<Self, ConfigError> {
        let hint = raw
            .get("id")
            .or_else(|| raw.get("name"))
            .or_else(|| raw.get("appKey"))
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
            .to_string();
        let malformed = |e: serde_json::Error| ConfigError::malformed(group, &hint, e);

        let item = match group {
            ConfigGroup::Plugin => {
                ConfigItem::Plugin(serde_json::from_value(raw).map_err(malformed)?)
            }
            ConfigGroup::Selector => {
                let selector: SelectorData = serde_json::from_value(raw).map_err(malformed)?;
                validate_handle(selector.handle.as_deref())
                    .map_err(|e| ConfigError::malformed(group, &selector.id, e))?;
                ConfigItem::Selector(selector)
            }
            ConfigGroup::Rule => {
                let rule: RuleData = serde_json::from_value(raw).map_err(malformed)?;
                validate_handle(rule.handle.as_deref())
                    .map_err(|e| ConfigError::malformed(group, &rule.id, e))?;
                ConfigItem::Rule(rule)
            }
            ConfigGroup::MetaData => {
                ConfigItem::MetaData(serde_json::from_value(raw).map_err(malformed)?)
            }
            ConfigGroup::AppAuth => {
                ConfigItem::AppAuth(serde_json::from_value(raw).map_err(malformed)?)
            }
        };
        Ok(item)
    }

    pub fn group(&self) -> ConfigGroup {
        match self {
            ConfigItem::Plugin(_) => ConfigGroup::Plugin,
            ConfigItem::Selector(_) => ConfigGroup::Selector,
            ConfigItem::Rule(_) => ConfigGroup::Rule,
            ConfigItem::MetaData(_) => ConfigGroup::MetaData,
            ConfigItem::AppAuth(_) => ConfigGroup::AppAuth,
        }
    }

    /// The key the entry is stored and deleted under.
    pub fn key(&self) -> &str {
        match self {
            ConfigItem::Plugin(p) => &p.name,
            ConfigItem::Selector(s) => &s.id,
            ConfigItem::Rule(r) => &r.id,
            ConfigItem::MetaData(m) => &m.path,
            ConfigItem::AppAuth(a) => &a.app_key,
        }
    }
}

/// Entries indexed by id and grouped under their owner.
trait Child {
    fn id(&self) -> &str;
    fn parent(&self) -> &str;
    fn sort(&self) -> i32;
}

impl Child for SelectorData {
    fn id(&self) -> &str {
        &self.id
    }
    fn parent(&self) -> &str {
        &self.plugin_name
    }
    fn sort(&self) -> i32 {
        self.sort
    }
}

impl Child for RuleData {
    fn id(&self) -> &str {
        &self.id
    }
    fn parent(&self) -> &str {
        &self.selector_id
    }
    fn sort(&self) -> i32 {
        self.sort
    }
}

/// Immutable snapshot of a child group: lookup by id plus the ordered
/// candidate list per owner.
#[derive(Debug)]
struct ChildIndex<T> {
    by_id: HashMap<String, Arc<T>>,
    by_parent: HashMap<String, Arc<Vec<Arc<T>>>>,
}

impl<T> Default for ChildIndex<T> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_parent: HashMap::new(),
        }
    }
}

impl<T> Clone for ChildIndex<T> {
    fn clone(&self) -> Self {
        Self {
            by_id: self.by_id.clone(),
            by_parent: self.by_parent.clone(),
        }
    }
}

impl<T: Child> ChildIndex<T> {
    fn build(items: Vec<T>) -> Self {
        let mut index = Self::default();
        let mut grouped: HashMap<String, Vec<Arc<T>>> = HashMap::new();
        for item in items {
            let item = Arc::new(item);
            // A repeated id keeps the last occurrence.
            if let Some(previous) = index.by_id.insert(item.id().to_string(), item.clone()) {
                if let Some(list) = grouped.get_mut(previous.parent()) {
                    list.retain(|e| e.id() != previous.id());
                }
            }
            grouped.entry(item.parent().to_string()).or_default().push(item);
        }
        index.by_parent = grouped
            .into_iter()
            .map(|(parent, mut list)| {
                list.sort_by_key(|e| e.sort());
                (parent, Arc::new(list))
            })
            .collect();
        index
    }

    fn with_upsert(&self, item: Arc<T>) -> Self {
        let mut next = self.without(item.id());
        let mut list: Vec<Arc<T>> = next
            .by_parent
            .get(item.parent())
            .map(|l| l.as_ref().clone())
            .unwrap_or_default();
        // Stable: among equal sort values the newer entry goes last.
        let position = list.partition_point(|e| e.sort() <= item.sort());
        list.insert(position, item.clone());
        next.by_parent.insert(item.parent().to_string(), Arc::new(list));
        next.by_id.insert(item.id().to_string(), item);
        next
    }

    fn without(&self, id: &str) -> Self {
        let mut next = self.clone();
        if let Some(removed) = next.by_id.remove(id) {
            let parent = removed.parent();
            let remaining: Vec<Arc<T>> = next
                .by_parent
                .get(parent)
                .map(|l| l.iter().filter(|e| e.id() != id).cloned().collect())
                .unwrap_or_default();
            if remaining.is_empty() {
                next.by_parent.remove(parent);
            } else {
                next.by_parent.insert(parent.to_string(), Arc::new(remaining));
            }
        }
        next
    }

    fn without_parent(&self, parent: &str) -> Self {
        let mut next = self.clone();
        if let Some(children) = next.by_parent.remove(parent) {
            for child in children.iter() {
                next.by_id.remove(child.id());
            }
        }
        next
    }
}

/// Thread-safe store of the latest plugins, selectors, rules, metadata and
/// app credentials.
#[derive(Debug, Default)]
pub struct ConfigCache {
    plugins: ArcSwap<HashMap<String, Arc<PluginData>>>,
    selectors: ArcSwap<ChildIndex<SelectorData>>,
    rules: ArcSwap<ChildIndex<RuleData>>,
    meta_data: ArcSwap<HashMap<String, Arc<MetaData>>>,
    app_auth: ArcSwap<HashMap<String, Arc<AppAuthData>>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every entry of `group` with `items` in one swap.  Items that
    /// belong to another group are skipped.
    pub fn apply_full_sync(&self, group: ConfigGroup, items: Vec<ConfigItem>) {
        let (items, foreign): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|item| item.group() == group);
        for item in foreign {
            warn_fmt!(
                "ConfigCache",
                "skipping {} entry '{}' in {} full sync",
                item.group(),
                item.key(),
                group
            );
        }
        let count = items.len();

        match group {
            ConfigGroup::Plugin => {
                let map = items
                    .into_iter()
                    .filter_map(|item| match item {
                        ConfigItem::Plugin(p) => Some((p.name.clone(), Arc::new(p))),
                        _ => None,
                    })
                    .collect();
                self.plugins.store(Arc::new(map));
            }
            ConfigGroup::Selector => {
                let list = items
                    .into_iter()
                    .filter_map(|item| match item {
                        ConfigItem::Selector(s) => Some(s),
                        _ => None,
                    })
                    .collect();
                self.selectors.store(Arc::new(ChildIndex::build(list)));
            }
            ConfigGroup::Rule => {
                let list = items
                    .into_iter()
                    .filter_map(|item| match item {
                        ConfigItem::Rule(r) => Some(r),
                        _ => None,
                    })
                    .collect();
                self.rules.store(Arc::new(ChildIndex::build(list)));
            }
            ConfigGroup::MetaData => {
                let map = items
                    .into_iter()
                    .filter_map(|item| match item {
                        ConfigItem::MetaData(m) => Some((m.path.clone(), Arc::new(m))),
                        _ => None,
                    })
                    .collect();
                self.meta_data.store(Arc::new(map));
            }
            ConfigGroup::AppAuth => {
                let map = items
                    .into_iter()
                    .filter_map(|item| match item {
                        ConfigItem::AppAuth(a) => Some((a.app_key.clone(), Arc::new(a))),
                        _ => None,
                    })
                    .collect();
                self.app_auth.store(Arc::new(map));
            }
        }
        debug_fmt!("ConfigCache", "full sync of {} applied with {} entries", group, count);
    }

    /// Insert or replace a single entry.
    pub fn apply_upsert(&self, item: ConfigItem) {
        match item {
            ConfigItem::Plugin(p) => {
                let p = Arc::new(p);
                self.plugins.rcu(|current| {
                    let mut next = (**current).clone();
                    next.insert(p.name.clone(), p.clone());
                    next
                });
            }
            ConfigItem::Selector(s) => {
                let s = Arc::new(s);
                self.selectors.rcu(|current| current.with_upsert(s.clone()));
            }
            ConfigItem::Rule(r) => {
                let r = Arc::new(r);
                self.rules.rcu(|current| current.with_upsert(r.clone()));
            }
            ConfigItem::MetaData(m) => {
                let m = Arc::new(m);
                self.meta_data.rcu(|current| {
                    let mut next: HashMap<String, Arc<MetaData>> = current
                        .iter()
                        .filter(|(_, e)| m.id.is_empty() || e.id != m.id)
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    next.insert(m.path.clone(), m.clone());
                    next
                });
            }
            ConfigItem::AppAuth(a) => {
                let a = Arc::new(a);
                self.app_auth.rcu(|current| {
                    let mut next = (**current).clone();
                    next.insert(a.app_key.clone(), a.clone());
                    next
                });
            }
        }
    }

    /// Remove a single entry; returns whether it existed.  Plugins are keyed
    /// by name, metadata by id or path, app credentials by app key.
    /// Deleting a selector also drops its rules.
    pub fn apply_delete(&self, group: ConfigGroup, key: &str) -> bool {
        match group {
            ConfigGroup::Plugin => {
                let previous = self.plugins.rcu(|current| {
                    let mut next = (**current).clone();
                    next.remove(key);
                    next
                });
                previous.contains_key(key)
            }
            ConfigGroup::Selector => {
                let previous = self.selectors.rcu(|current| current.without(key));
                let existed = previous.by_id.contains_key(key);
                if existed {
                    self.rules.rcu(|current| current.without_parent(key));
                }
                existed
            }
            ConfigGroup::Rule => {
                let previous = self.rules.rcu(|current| current.without(key));
                previous.by_id.contains_key(key)
            }
            ConfigGroup::MetaData => {
                let previous = self.meta_data.rcu(|current| {
                    current
                        .iter()
                        .filter(|(path, m)| path.as_str() != key && m.id != key)
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<HashMap<_, _>>()
                });
                previous.iter().any(|(path, m)| path == key || m.id == key)
            }
            ConfigGroup::AppAuth => {
                let previous = self.app_auth.rcu(|current| {
                    let mut next = (**current).clone();
                    next.remove(key);
                    next
                });
                previous.contains_key(key)
            }
        }
    }

    pub fn plugin_by_name(&self, name: &str) -> Option<Arc<PluginData>> {
        self.plugins.load().get(name).cloned()
    }

    pub fn plugins(&self) -> Vec<Arc<PluginData>> {
        self.plugins.load().values().cloned().collect()
    }

    /// Selectors of `plugin` in ascending `sort` order (disabled included).
    pub fn selectors_for(&self, plugin: &str) -> Arc<Vec<Arc<SelectorData>>> {
        self.selectors
            .load()
            .by_parent
            .get(plugin)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_selectors(&self) -> Vec<Arc<SelectorData>> {
        self.selectors.load().by_id.values().cloned().collect()
    }

    pub fn all_rules(&self) -> Vec<Arc<RuleData>> {
        self.rules.load().by_id.values().cloned().collect()
    }

    pub fn selector_by_id(&self, id: &str) -> Option<Arc<SelectorData>> {
        self.selectors.load().by_id.get(id).cloned()
    }

    /// Rules of `selector_id` in ascending `sort` order (disabled included).
    pub fn rules_for(&self, selector_id: &str) -> Arc<Vec<Arc<RuleData>>> {
        self.rules
            .load()
            .by_parent
            .get(selector_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rule_by_id(&self, id: &str) -> Option<Arc<RuleData>> {
        self.rules.load().by_id.get(id).cloned()
    }

    pub fn meta_data_for(&self, path: &str) -> Option<Arc<MetaData>> {
        self.meta_data.load().get(path).cloned()
    }

    pub fn app_auth(&self, app_key: &str) -> Option<Arc<AppAuthData>> {
        self.app_auth.load().get(app_key).cloned()
    }

    /// Number of cached entries in `group`.
    pub fn len(&self, group: ConfigGroup) -> usize {
        match group {
            ConfigGroup::Plugin => self.plugins.load().len(),
            ConfigGroup::Selector => self.selectors.load().by_id.len(),
            ConfigGroup::Rule => self.rules.load().by_id.len(),
            ConfigGroup::MetaData => self.meta_data.load().len(),
            ConfigGroup::AppAuth => self.app_auth.load().len(),
        }
    }
}
