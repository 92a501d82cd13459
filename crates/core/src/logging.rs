//! Structured logging infrastructure for tokensign.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.
//!
//! Security-relevant outcomes (passphrase failures, lockouts, rejected
//! payloads, verification verdicts) are emitted under [`AUDIT_TARGET`] so they
//! can be routed separately, e.g. `RUST_LOG=info,tokensign::audit=debug`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target used for audit events.
pub const AUDIT_TARGET: &str = "tokensign::audit";

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Initialize the logging system with human-readable output on stderr.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use tokensign_core::logging;
///
/// logging::init();
/// tracing::info!("Application started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

/// Initialize the logging system with JSON output.
///
/// This format is suitable for log aggregation systems and structured log analysis.
///
/// # Example
/// ```no_run
/// use tokensign_core::logging;
///
/// logging::init_json();
/// tracing::info!(tool = "tokensign", "Started");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Install a test writer subscriber; safe to call from every test.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(env_filter("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
