//! Logging bootstrap for hosts that do not install their own subscriber.
//!
//! ## Usage
//!
//! ```no_run
//! use vigil::VigilConfig;
//!
//! let config = VigilConfig::default();
//! vigil::logging::init_tracing(&config.logging);
//! vigil::logging::init_deadlock_detection(&config.logging);
//! ```

use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use crate::config::LoggingConfig;

/// Installs a `tracing` subscriber filtered by `RUST_LOG`, or by
/// `config.default_filter` when the variable is unset or invalid.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let (filter, rejected) = filter_for(config);
    let span_events = if config.span_close_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_thread_names(true);
    let installed = if config.pretty {
        builder.pretty().try_init().is_ok()
    } else {
        builder.compact().try_init().is_ok()
    };
    if installed && let Some(directives) = rejected {
        warn!(%directives, "ignoring invalid log filter");
    }
    installed
}

/// Filter to install, plus the directives that had to be skipped.
fn filter_for(config: &LoggingConfig) -> (EnvFilter, Option<String>) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return (filter, None);
    }
    match EnvFilter::try_new(&config.default_filter) {
        Ok(filter) => (filter, None),
        Err(_) => (EnvFilter::new("error"), Some(config.default_filter.clone())),
    }
}

/// Starts a watchdog thread that checks `parking_lot` locks for cycles every
/// `config.deadlock_check_interval` and logs each one with its backtraces.
/// Debug builds only; only the first call starts a thread.
pub fn init_deadlock_detection(config: &LoggingConfig) {
    #[cfg(debug_assertions)]
    {
        use std::{sync::Once, thread};

        static INIT: Once = Once::new();
        let interval = config.deadlock_check_interval;
        INIT.call_once(|| {
            let spawned = thread::Builder::new()
                .name("vigil-deadlock-watchdog".to_owned())
                .spawn(move || {
                    loop {
                        thread::sleep(interval);
                        report_deadlocks();
                    }
                });
            if let Err(err) = spawned {
                warn!("failed to start deadlock watchdog: {err}");
            }
        });
    }
    #[cfg(not(debug_assertions))]
    let _ = config;
}

/// Logs every lock cycle found right now. Returns how many there were.
#[cfg(debug_assertions)]
fn report_deadlocks() -> usize {
    let cycles = parking_lot::deadlock::check_deadlock();
    for (cycle, threads) in cycles.iter().enumerate() {
        for thread in threads {
            tracing::error!(
                cycle,
                of = cycles.len(),
                thread_id = ?thread.thread_id(),
                backtrace = ?thread.backtrace(),
                "lock cycle detected"
            );
        }
    }
    cycles.len()
}
