// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging set-up for Vireo.
//!
//! Library code always logs through the `log` facade (usually via the
//! `*_fmt!` macros in [`wrapper`]).  At start-up either `env_logger` or the
//! structured `slog` pipeline is installed as the backend.

pub mod config;
pub mod middleware;
pub mod structured;
#[macro_use]
pub mod wrapper;


use log::LevelFilter;
use once_cell::sync::OnceCell;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use self::config::LoggingConfig;
use self::structured::LoggerGuard;

static INIT: Once = Once::new();
static USING_STRUCTURED: AtomicBool = AtomicBool::new(false);

/// Keeps the slog scope alive for the lifetime of the process.
static GLOBAL_GUARD: OnceCell<LoggerGuard> = OnceCell::new();

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Trace => "trace",
        LevelFilter::Debug => "debug",
        LevelFilter::Info => "info",
        LevelFilter::Warn => "warn",
        LevelFilter::Error => "error",
        LevelFilter::Off => "off",
    }
}

fn init_env_logger(level: LevelFilter) {
    let env = env_logger::Env::default().filter_or("RUST_LOG", level_name(level));
    // A test harness may already have installed a logger.
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_target(true)
        .try_init();
}

/// Install `env_logger` at the given level.  Later calls are no-ops.
pub fn init(level: Option<LevelFilter>) {
    INIT.call_once(|| {
        init_env_logger(level.unwrap_or(LevelFilter::Info));
        log::info!("Logging initialized at level: {}", log::max_level());
    });
}

/// Install the backend selected by `config`.  Later calls are no-ops.
pub fn init_with_config(level: LevelFilter, config: &LoggingConfig) {
    INIT.call_once(|| {
        if config.structured {
            let guard = structured::init_global_logger(&config.to_logger_config());
            // Route `log` records into slog.
            if slog_stdlog::init_with_level(level.to_level().unwrap_or(log::Level::Info)).is_ok() {
                USING_STRUCTURED.store(true, Ordering::SeqCst);
            }
            let _ = GLOBAL_GUARD.set(guard);
        } else {
            init_env_logger(level);
        }
        log::set_max_level(level);
        log::info!(
            "Logging initialized at level {} ({})",
            level,
            if is_structured() { "structured" } else { "plain" }
        );
    });
}

/// Whether the slog pipeline is the active backend.
pub fn is_structured() -> bool {
    USING_STRUCTURED.load(Ordering::SeqCst)
}
