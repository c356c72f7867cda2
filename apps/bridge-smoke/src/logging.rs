//! Tracing/logging bootstrap for the smoke binary.

use std::env;

use bridge_core::LogLevel;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,bridge_runtime=debug,bridge_smoke=debug";

/// Initialize global tracing subscriber with severity gating from environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `MESSENGER_BRIDGE_LOG`
/// 3) the session's configured log level
/// 4) internal default filter
pub fn init(log_level: Option<LogLevel>) {
    let env_filter = filter_from_env(log_level);
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env(log_level: Option<LogLevel>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("MESSENGER_BRIDGE_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        if let Ok(filter) = EnvFilter::try_new(value) {
            return filter;
        }
    }

    if let Some(level) = log_level {
        return EnvFilter::new(level.as_filter_directive());
    }

    EnvFilter::new(DEFAULT_FILTER)
}
