// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Context-prefixed logging macros over the `log` facade.
//!
//! Every line reads `[Context] message`.  When structured logging is active
//! the `slog_stdlog` bridge forwards these records into slog.

#[doc(hidden)]
#[macro_export]
macro_rules! context_log {
    ($level:expr, $context:expr, $($arg:tt)+) => {
        log::log!($level, "[{}] {}", $context, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! error_fmt {
    ($context:expr, $($arg:tt)+) => {
        $crate::context_log!(log::Level::Error, $context, $($arg)+)
    };
}

#[macro_export]
macro_rules! warn_fmt {
    ($context:expr, $($arg:tt)+) => {
        $crate::context_log!(log::Level::Warn, $context, $($arg)+)
    };
}

#[macro_export]
macro_rules! info_fmt {
    ($context:expr, $($arg:tt)+) => {
        $crate::context_log!(log::Level::Info, $context, $($arg)+)
    };
}

#[macro_export]
macro_rules! debug_fmt {
    ($context:expr, $($arg:tt)+) => {
        $crate::context_log!(log::Level::Debug, $context, $($arg)+)
    };
}

/// Per-request detail; compiled in but usually filtered out.
#[macro_export]
macro_rules! trace_fmt {
    ($context:expr, $($arg:tt)+) => {
        $crate::context_log!(log::Level::Trace, $context, $($arg)+)
    };
}
