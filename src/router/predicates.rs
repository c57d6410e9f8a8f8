// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition evaluation.
//!
//! A condition reads one attribute of the request (see [`ParamType`]) and
//! compares it with its configured value using one operator:
//!
//! | operator     | semantics                                              |
//! |--------------|--------------------------------------------------------|
//! | `=`          | exact string equality                                  |
//! | `match`      | ant-style path; `*` is one segment, `**` any suffix,   |
//! |              | `{name}` one segment, `/a/**` also matches `/a`        |
//! | `regex`      | the whole attribute must match the expression          |
//! | `contains`   | substring                                              |
//! | `startsWith` | prefix                                                 |
//! | `endsWith`   | suffix                                                 |
//! | `exclude`    | not equal                                              |
//!
//! Unknown operators and patterns that fail to compile never match.

use std::collections::HashMap;

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;

use crate::core::{ConditionData, MatchMode, ParamType, ProxyRequest};
use crate::warn_fmt;

/// The decoded request attributes conditions are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RequestAttributes {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Keyed by lower-cased header name
    pub headers: HashMap<String, String>,
    /// Host name without port
    pub host: Option<String>,
    pub ip: Option<String>,
    pub method: String,
    pub cookies: HashMap<String, String>,
}

impl RequestAttributes {
    pub fn from_request(request: &ProxyRequest) -> Self {
        let headers: HashMap<String, String> = request
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();

        let host = headers.get("host").map(|h| strip_port(h).to_string());

        let cookies = headers
            .get("cookie")
            .map(|raw| parse_cookies(raw))
            .unwrap_or_default();

        Self {
            path: request.path.clone(),
            query: request.query.as_deref().map(parse_query).unwrap_or_default(),
            headers,
            host,
            ip: request.client_ip.clone(),
            method: request.method.as_str().to_string(),
            cookies,
        }
    }

    /// The attribute a condition reads, or `None` when the request lacks it.
    pub fn extract(&self, param_type: ParamType, name: &str) -> Option<&str> {
        match param_type {
            ParamType::Uri => Some(self.path.as_str()),
            ParamType::Query => self.query.get(name).map(String::as_str),
            ParamType::Header => self.headers.get(&name.to_lowercase()).map(String::as_str),
            ParamType::Host => self.host.as_deref(),
            ParamType::Ip => self.ip.as_deref(),
            ParamType::Cookie => self.cookies.get(name).map(String::as_str),
            ParamType::Method => Some(self.method.as_str()),
        }
    }
}

/// Decode `a=1&b=x%20y` into a map.  The first occurrence of a key wins.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        let value = decode_component(value);
        params.entry(key).or_insert(value);
    }
    params
}

/// The host part of a `Host` header.  Bracketed IPv6 literals keep their
/// brackets, and a bare IPv6 address without a port is left untouched.
pub fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.split_once(':') {
        Some((name, port)) if !port.contains(':') => name,
        _ => authority,
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|c| c.into_owned())
        .unwrap_or(spaced)
}

fn parse_cookies(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// A condition operator with its pattern compiled.
#[derive(Debug, Clone)]
pub enum CompiledOperator {
    Equals(String),
    /// The matcher, plus the bare prefix when the pattern ends in `/**`
    Glob(GlobMatcher, Option<String>),
    Regex(Regex),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Exclude(String),
    /// Unknown operator or a pattern that failed to compile
    Invalid(String),
}

impl CompiledOperator {
    pub fn compile(operator: &str, value: &str) -> Self {
        match operator {
            "=" => CompiledOperator::Equals(value.to_string()),
            "match" => {
                let pattern = path_variables_as_segments(value);
                let prefix = pattern.strip_suffix("/**").map(str::to_string);
                GlobBuilder::new(&pattern)
                    .literal_separator(true)
                    .build()
                    .map(|g| CompiledOperator::Glob(g.compile_matcher(), prefix))
                    .unwrap_or_else(|e| {
                        CompiledOperator::Invalid(format!("bad glob '{value}': {e}"))
                    })
            }
            "regex" => Regex::new(&format!("^(?:{value})$"))
                .map(CompiledOperator::Regex)
                .unwrap_or_else(|e| CompiledOperator::Invalid(format!("bad regex '{value}': {e}"))),
            "contains" => CompiledOperator::Contains(value.to_string()),
            "startsWith" => CompiledOperator::StartsWith(value.to_string()),
            "endsWith" => CompiledOperator::EndsWith(value.to_string()),
            "exclude" => CompiledOperator::Exclude(value.to_string()),
            other => CompiledOperator::Invalid(format!("unknown operator '{other}'")),
        }
    }

    pub fn is_match(&self, actual: &str) -> bool {
        match self {
            CompiledOperator::Equals(expected) => actual == expected,
            CompiledOperator::Glob(glob, prefix) => {
                glob.is_match(actual) || prefix.as_deref().is_some_and(|p| actual == p)
            }
            CompiledOperator::Regex(re) => re.is_match(actual),
            CompiledOperator::Contains(needle) => actual.contains(needle.as_str()),
            CompiledOperator::StartsWith(prefix) => actual.starts_with(prefix.as_str()),
            CompiledOperator::EndsWith(suffix) => actual.ends_with(suffix.as_str()),
            CompiledOperator::Exclude(expected) => actual != expected,
            CompiledOperator::Invalid(_) => false,
        }
    }
}

/// Rewrite `{name}` path variables to `*` so they bind exactly one segment
/// instead of being read as glob alternation.
fn path_variables_as_segments(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let Some(len) = rest[open..].find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        out.push('*');
        rest = &rest[open + len + 1..];
    }
    out.push_str(rest);
    out
}

/// Evaluate one condition.  A missing attribute never matches.
pub fn condition_matches(condition: &ConditionData, attributes: &RequestAttributes) -> bool {
    let compiled = condition.compiled.get_or_init(|| {
        let op = CompiledOperator::compile(&condition.operator, &condition.param_value);
        if let CompiledOperator::Invalid(reason) = &op {
            warn_fmt!("Matcher", "condition on {:?} never matches: {}", condition.param_type, reason);
        }
        op
    });

    match attributes.extract(condition.param_type, &condition.param_name) {
        Some(actual) => compiled.is_match(actual),
        None => false,
    }
}

/// Combine conditions: every one for [`MatchMode::And`], at least one for
/// [`MatchMode::Or`].  An empty AND list matches, an empty OR list does not.
pub fn matches(
    conditions: &[ConditionData],
    attributes: &RequestAttributes,
    mode: MatchMode,
) -> bool {
    match mode {
        MatchMode::And => conditions.iter().all(|c| condition_matches(c, attributes)),
        MatchMode::Or => conditions.iter().any(|c| condition_matches(c, attributes)),
    }
}
