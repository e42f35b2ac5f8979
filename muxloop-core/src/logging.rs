//! Structured logging setup.
//!
//! `RUST_LOG` takes precedence over the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global fmt subscriber.
///
/// Returns false if a subscriber was already installed, which makes it
/// safe to call from every test and demo.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(config.ansi)
                .with_thread_names(config.thread_names),
        )
        .try_init()
        .is_ok()
}
