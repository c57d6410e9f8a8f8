// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured logging backed by slog.

use chrono::{DateTime, SecondsFormat, Utc};
use slog::{Drain, Logger, o};
use slog_async::Async;
use slog_json::Json;
use slog_term::{FullFormat, TermDecorator};
use std::io;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Terminal,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LogFormat,
    pub level: slog::Level,
    pub include_location: bool,
    pub include_thread_id: bool,
    pub static_fields: Vec<(String, String)>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Terminal,
            level: slog::Level::Info,
            include_location: true,
            include_thread_id: true,
            static_fields: Vec::new(),
        }
    }
}

/// Build the root logger for `config`.
pub fn create_logger(config: &LoggerConfig) -> Logger {
    let root = match config.format {
        LogFormat::Terminal => {
            let decorator = TermDecorator::new().build();
            let drain = FullFormat::new(decorator).build().fuse();
            let drain = drain.filter_level(config.level).fuse();
            Logger::root(Async::new(drain).build().fuse(), o!("service" => "vireo"))
        }
        LogFormat::Json => {
            let drain = Json::new(io::stdout()).add_default_keys().build().fuse();
            let drain = drain.filter_level(config.level).fuse();
            Logger::root(Async::new(drain).build().fuse(), o!("service" => "vireo"))
        }
    };

    let root = if config.include_thread_id {
        let thread = slog::FnValue(|_: &slog::Record<'_>| {
            format!("{:?}", std::thread::current().id())
        });
        root.new(o!("thread" => thread))
    } else {
        root
    };

    config.static_fields.iter().fold(root, |logger, (key, value)| {
        // slog keys are 'static; static fields live for the whole process.
        let key: &'static str = Box::leak(key.clone().into_boxed_str());
        logger.new(o!(key => value.clone()))
    })
}

pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Per-request logging context.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub trace_id: String,
    pub method: String,
    pub path: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub start: Instant,
    pub received_at: DateTime<Utc>,
}

impl RequestInfo {
    /// Fresh context with a newly minted trace id.
    pub fn new(method: &str, path: &str, remote_addr: &str, user_agent: &str) -> Self {
        Self::with_trace_id(generate_trace_id(), method, path, remote_addr, user_agent)
    }

    pub fn with_trace_id(
        trace_id: String,
        method: &str,
        path: &str,
        remote_addr: &str,
        user_agent: &str,
    ) -> Self {
        Self {
            trace_id,
            method: method.to_string(),
            path: path.to_string(),
            remote_addr: remote_addr.to_string(),
            user_agent: user_agent.to_string(),
            start: Instant::now(),
            received_at: Utc::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    /// Arrival time as RFC 3339 with millisecond precision.
    pub fn received_at_rfc3339(&self) -> String {
        self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Child logger carrying the request's identity.
pub fn with_request_context(logger: &Logger, info: &RequestInfo) -> Logger {
    logger.new(o!(
        "trace_id" => info.trace_id.clone(),
        "method" => info.method.clone(),
        "path" => info.path.clone(),
        "remote_addr" => info.remote_addr.clone(),
    ))
}

/// Keeps the global slog logger installed while alive.
pub struct LoggerGuard {
    _guard: slog_scope::GlobalLoggerGuard,
}

pub fn init_global_logger(config: &LoggerConfig) -> LoggerGuard {
    LoggerGuard {
        _guard: slog_scope::set_global_logger(create_logger(config)),
    }
}
