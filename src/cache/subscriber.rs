// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Config ingestion from synchronization collaborators.
//!
//! Sync transports deliver raw JSON entries through [`DataSubscriber`].
//! [`CommonDataSubscriber`] parses them, skips malformed entries, applies the
//! rest to the [`ConfigCache`] and notifies the [`DataHandler`] registered
//! for the owning plugin, so plugins can maintain derived state such as
//! upstream pools or rate limiters.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::{ConfigCache, ConfigItem};
use crate::core::{ConfigGroup, PluginData, RuleData, SelectorData};
use crate::plugins::PluginChain;
use crate::{debug_fmt, error_fmt, info_fmt};

/// Receiver of configuration events.  Every call is idempotent; upserts and
/// deletes of unrelated keys may arrive in any order.
pub trait DataSubscriber: Send + Sync {
    /// Replace the whole group.  An empty list clears it.
    fn on_full_sync(&self, group: ConfigGroup, items: Vec<Value>);

    fn on_upsert(&self, group: ConfigGroup, item: Value);

    fn on_delete(&self, group: ConfigGroup, key: &str);
}

/// Per-plugin hook into config changes.  All methods default to no-ops.
pub trait DataHandler: Send + Sync {
    /// Name of the plugin whose data this handler follows.
    fn plugin_name(&self) -> &str;

    fn handle_plugin(&self, _plugin: &PluginData) {}

    fn remove_plugin(&self, _plugin: &PluginData) {}

    fn handle_selector(&self, _selector: &SelectorData) {}

    fn remove_selector(&self, _selector: &SelectorData) {}

    fn handle_rule(&self, _rule: &RuleData) {}

    fn remove_rule(&self, _rule: &RuleData) {}
}

pub struct CommonDataSubscriber {
    cache: Arc<ConfigCache>,
    handlers: HashMap<String, Arc<dyn DataHandler>>,
    chain: Option<Arc<PluginChain>>,
}

impl std::fmt::Debug for CommonDataSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommonDataSubscriber")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CommonDataSubscriber {
    pub fn new(cache: Arc<ConfigCache>) -> Self {
        Self {
            cache,
            handlers: HashMap::new(),
            chain: None,
        }
    }

    /// Register a handler; a later handler for the same plugin replaces the
    /// earlier one.
    pub fn with_handler(mut self, handler: Arc<dyn DataHandler>) -> Self {
        self.handlers.insert(handler.plugin_name().to_string(), handler);
        self
    }

    /// Chain to re-order whenever plugin descriptors change.
    pub fn with_chain(mut self, chain: Arc<PluginChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    fn handler(&self, plugin: &str) -> Option<&Arc<dyn DataHandler>> {
        self.handlers.get(plugin)
    }

    fn handler_for_rule(&self, rule: &RuleData) -> Option<&Arc<dyn DataHandler>> {
        if !rule.plugin_name.is_empty() {
            return self.handler(&rule.plugin_name);
        }
        self.cache
            .selector_by_id(&rule.selector_id)
            .and_then(|s| self.handler(&s.plugin_name))
    }

    fn parse(&self, group: ConfigGroup, raw: Value) -> Option<ConfigItem> {
        match ConfigItem::parse(group, raw) {
            Ok(item) => Some(item),
            Err(e) => {
                error_fmt!("Subscriber", "skipping entry: {}", e);
                None
            }
        }
    }

    fn reorder_chain(&self) {
        if let Some(chain) = &self.chain {
            chain.reorder(&self.cache);
        }
    }

    fn notify_upsert(&self, item: &ConfigItem) {
        match item {
            ConfigItem::Plugin(p) => {
                if let Some(h) = self.handler(&p.name) {
                    h.handle_plugin(p);
                }
            }
            ConfigItem::Selector(s) => {
                if let Some(h) = self.handler(&s.plugin_name) {
                    h.handle_selector(s);
                }
            }
            ConfigItem::Rule(r) => {
                if let Some(h) = self.handler_for_rule(r) {
                    h.handle_rule(r);
                }
            }
            ConfigItem::MetaData(_) | ConfigItem::AppAuth(_) => {}
        }
    }
}

impl DataSubscriber for CommonDataSubscriber {
    fn on_full_sync(&self, group: ConfigGroup, items: Vec<Value>) {
        let total = items.len();
        let parsed: Vec<ConfigItem> = items
            .into_iter()
            .filter_map(|raw| self.parse(group, raw))
            .collect();

        // Tell handlers about entries that disappear with this sync.
        match group {
            ConfigGroup::Plugin => {
                for old in self.cache.plugins() {
                    if !parsed.iter().any(|i| i.key() == old.name) {
                        if let Some(h) = self.handler(&old.name) {
                            h.remove_plugin(&old);
                        }
                    }
                }
            }
            ConfigGroup::Selector => {
                for old in self.cache.all_selectors() {
                    if !parsed.iter().any(|i| i.key() == old.id) {
                        if let Some(h) = self.handler(&old.plugin_name) {
                            h.remove_selector(&old);
                        }
                    }
                }
            }
            ConfigGroup::Rule => {
                for old in self.cache.all_rules() {
                    if !parsed.iter().any(|i| i.key() == old.id) {
                        if let Some(h) = self.handler_for_rule(&old) {
                            h.remove_rule(&old);
                        }
                    }
                }
            }
            ConfigGroup::MetaData | ConfigGroup::AppAuth => {}
        }

        let applied = parsed.len();
        self.cache.apply_full_sync(group, parsed.clone());
        for item in &parsed {
            self.notify_upsert(item);
        }
        if group == ConfigGroup::Plugin {
            self.reorder_chain();
        }

        info_fmt!("Subscriber", "{} full sync: {} of {} entries applied", group, applied, total);
    }

    fn on_upsert(&self, group: ConfigGroup, item: Value) {
        let Some(item) = self.parse(group, item) else {
            return;
        };
        debug_fmt!("Subscriber", "upsert {} '{}'", group, item.key());

        self.cache.apply_upsert(item.clone());
        self.notify_upsert(&item);
        if group == ConfigGroup::Plugin {
            self.reorder_chain();
        }
    }

    fn on_delete(&self, group: ConfigGroup, key: &str) {
        match group {
            ConfigGroup::Plugin => {
                let previous = self.cache.plugin_by_name(key);
                self.cache.apply_delete(group, key);
                if let Some(p) = previous {
                    if let Some(h) = self.handler(&p.name) {
                        h.remove_plugin(&p);
                    }
                }
                self.reorder_chain();
            }
            ConfigGroup::Selector => {
                let previous = self.cache.selector_by_id(key);
                let rules = self.cache.rules_for(key);
                self.cache.apply_delete(group, key);
                if let Some(s) = previous {
                    if let Some(h) = self.handler(&s.plugin_name) {
                        for rule in rules.iter() {
                            h.remove_rule(rule);
                        }
                        h.remove_selector(&s);
                    }
                }
            }
            ConfigGroup::Rule => {
                let previous = self.cache.rule_by_id(key);
                if let Some(r) = &previous {
                    if let Some(h) = self.handler_for_rule(r) {
                        h.remove_rule(r);
                    }
                }
                self.cache.apply_delete(group, key);
            }
            ConfigGroup::MetaData | ConfigGroup::AppAuth => {
                self.cache.apply_delete(group, key);
            }
        }
        debug_fmt!("Subscriber", "deleted {} '{}'", group, key);
    }
}
