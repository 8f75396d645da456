//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "info,forge_rhi=debug,forge_vulkan=debug";

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the logging system with tracing.
///
/// This sets up tracing-subscriber with:
/// - Environment-based filtering (RUST_LOG)
/// - Targets and thread ids on every line, since command lists are
///   recorded from worker threads
///
/// # Panics
///
/// Panics if a global subscriber was already installed. Use
/// [`try_init_logging`] where that can happen (tests).
///
/// # Example
/// ```
/// forge_core::init_logging();
/// tracing::info!("Device created");
/// ```
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Like [`init_logging`], but returns `false` instead of panicking when a
/// global subscriber is already set.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_test_writer(),
        )
        .try_init()
        .is_ok()
}
