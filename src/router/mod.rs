// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Selector and rule resolution.
//!
//! A [`MatchResolver`] reads the current snapshot of a plugin's selectors
//! from the [`ConfigCache`] and returns the **first** enabled selector (in
//! ascending `sort` order) whose conditions match.  Rules of the matched
//! selector are resolved the same way.  Absence is a normal outcome and is
//! returned as `None`; the calling plugin decides how to react.

mod predicates;


pub use predicates::*;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::ConfigCache;
use crate::core::{RuleData, SelectorData, SelectorType};
use crate::trace_fmt;

/// What happens after a matched selector yields no matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallthroughPolicy {
    /// The first matching selector is final
    #[default]
    FirstMatch,
    /// A selector flagged `continued` hands over to the next matching one
    Continued,
}

/// Outcome of resolving a plugin's selector and rule for one request.
#[derive(Debug, Clone)]
pub enum Resolution {
    NoSelector,
    NoRule(Arc<SelectorData>),
    Matched {
        selector: Arc<SelectorData>,
        rule: Arc<RuleData>,
    },
}

#[derive(Debug, Clone)]
pub struct MatchResolver {
    cache: Arc<ConfigCache>,
    policy: FallthroughPolicy,
}

impl MatchResolver {
    pub fn new(cache: Arc<ConfigCache>, policy: FallthroughPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn policy(&self) -> FallthroughPolicy {
        self.policy
    }

    fn selector_matches(selector: &SelectorData, attributes: &RequestAttributes) -> bool {
        selector.enabled
            && match selector.selector_type {
                SelectorType::FullFlow => true,
                SelectorType::Custom => {
                    matches(&selector.conditions, attributes, selector.match_mode)
                }
            }
    }

    /// First enabled selector of `plugin` matching the request.
    pub fn resolve_selector(
        &self,
        plugin: &str,
        attributes: &RequestAttributes,
    ) -> Option<Arc<SelectorData>> {
        self.cache
            .selectors_for(plugin)
            .iter()
            .find(|s| Self::selector_matches(s, attributes))
            .cloned()
    }

    /// First enabled rule of `selector` matching the request.
    pub fn resolve_rule(
        &self,
        selector: &SelectorData,
        attributes: &RequestAttributes,
    ) -> Option<Arc<RuleData>> {
        self.cache
            .rules_for(&selector.id)
            .iter()
            .find(|r| r.enabled && matches(&r.conditions, attributes, r.match_mode))
            .cloned()
    }

    /// Selector then rule, honouring the fallthrough policy.
    pub fn resolve(&self, plugin: &str, attributes: &RequestAttributes) -> Resolution {
        let selectors = self.cache.selectors_for(plugin);
        let mut first_without_rule: Option<Arc<SelectorData>> = None;

        for selector in selectors
            .iter()
            .filter(|s| Self::selector_matches(s, attributes))
        {
            if let Some(rule) = self.resolve_rule(selector, attributes) {
                return Resolution::Matched {
                    selector: selector.clone(),
                    rule,
                };
            }

            trace_fmt!("Resolver", "selector '{}' of '{}' matched but no rule did", selector.id, plugin);
            if first_without_rule.is_none() {
                first_without_rule = Some(selector.clone());
            }
            if self.policy == FallthroughPolicy::FirstMatch || !selector.continued {
                break;
            }
        }

        match first_without_rule {
            Some(selector) => Resolution::NoRule(selector),
            None => Resolution::NoSelector,
        }
    }
}
