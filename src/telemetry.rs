//! Logging setup for test runs
//!
//! Plain `tracing` output filtered by `RUST_LOG`. Every test may call
//! [`init_logging`]; only the first call installs a subscriber.
//!
//! # Example
//!
//! ```no_run
//! use kube_testrun::telemetry::init_logging;
//!
//! init_logging();
//! // RUST_LOG=kube_testrun=debug shows every poll attempt
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

/// Install a stderr subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Like [`init_logging`], but output goes through libtest's capture
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
