// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment variable configuration provider.
//!
//! `VIREO_SERVER_PORT` maps to `server.port`.  Keys whose segments contain
//! underscores use a double underscore as separator instead:
//! `VIREO_GATEWAY__HTTP_CLIENT__TIMEOUT_MS` maps to
//! `gateway.http_client.timeout_ms`.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::env;

use super::ConfigError;
use super::ConfigProvider;

/// Default variable prefix.
pub const DEFAULT_PREFIX: &str = "VIREO_";

#[derive(Debug)]
pub struct EnvConfigProvider {
    prefix: String,
    /// Prefixed variables, already translated to dotted keys
    cache: HashMap<String, String>,
}

impl EnvConfigProvider {
    pub fn new(prefix: &str) -> Self {
        let mut provider = Self {
            prefix: prefix.to_string(),
            cache: HashMap::new(),
        };
        provider.refresh_cache();
        provider
    }

    /// Re-read the process environment.
    pub fn refresh_cache(&mut self) {
        self.cache = env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(&self.prefix)
                    .map(|rest| (Self::to_config_key(rest), value))
            })
            .collect();
    }

    fn to_config_key(raw: &str) -> String {
        let lower = raw.to_lowercase();
        if lower.contains("__") {
            lower.split("__").collect::<Vec<_>>().join(".")
        } else {
            lower.replace('_', ".")
        }
    }

    /// Interpret a variable's text as JSON where possible.
    fn parse_value(value: &str) -> Value {
        if let Ok(parsed) = serde_json::from_str(value) {
            return parsed;
        }
        if value.eq_ignore_ascii_case("true") {
            return json!(true);
        }
        if value.eq_ignore_ascii_case("false") {
            return json!(false);
        }
        json!(value)
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    fn provider_name(&self) -> &str {
        "env"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.cache.get(key).map(|v| Self::parse_value(v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigProviderExt;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_single_underscore_keys() {
        unsafe {
            env::set_var("VIREO_SERVER_HOST", "0.0.0.0");
            env::set_var("VIREO_SERVER_PORT", "9195");
        }

        let provider = EnvConfigProvider::default();
        let host: String = provider.get("server.host").unwrap().unwrap();
        let port: u16 = provider.get("server.port").unwrap().unwrap();
        assert_eq!(host, "0.0.0.0");
        assert_eq!(port, 9195);

        unsafe {
            env::remove_var("VIREO_SERVER_HOST");
            env::remove_var("VIREO_SERVER_PORT");
        }
    }

    #[test]
    #[serial]
    fn test_double_underscore_keeps_segment_underscores() {
        unsafe {
            env::set_var("VIREO_GATEWAY__HTTP_CLIENT__TIMEOUT_MS", "5000");
        }

        let provider = EnvConfigProvider::default();
        assert!(provider.has("gateway.http_client.timeout_ms"));
        let timeout: u64 = provider
            .get("gateway.http_client.timeout_ms")
            .unwrap()
            .unwrap();
        assert_eq!(timeout, 5000);

        unsafe {
            env::remove_var("VIREO_GATEWAY__HTTP_CLIENT__TIMEOUT_MS");
        }
    }

    #[test]
    #[serial]
    fn test_value_types() {
        unsafe {
            env::set_var("VIREO_FLAG", "TRUE");
            env::set_var("VIREO_LIST", "[1, 2, 3]");
            env::set_var("VIREO_TEXT", "{not json}");
        }

        let provider = EnvConfigProvider::default();
        let flag: bool = provider.get("flag").unwrap().unwrap();
        let list: Vec<u32> = provider.get("list").unwrap().unwrap();
        let text: String = provider.get("text").unwrap().unwrap();
        assert!(flag);
        assert_eq!(list, vec![1, 2, 3]);
        assert_eq!(text, "{not json}");

        unsafe {
            env::remove_var("VIREO_FLAG");
            env::remove_var("VIREO_LIST");
            env::remove_var("VIREO_TEXT");
        }
    }

    #[test]
    #[serial]
    fn test_refresh_picks_up_new_variables() {
        let mut provider = EnvConfigProvider::new("VIREO_REFRESH_");
        assert!(!provider.has("value"));

        unsafe {
            env::set_var("VIREO_REFRESH_VALUE", "42");
        }
        assert!(!provider.has("value"));

        provider.refresh_cache();
        let value: i32 = provider.get("value").unwrap().unwrap();
        assert_eq!(value, 42);

        unsafe {
            env::remove_var("VIREO_REFRESH_VALUE");
        }
    }
}
