//! Structured logging setup.
//!
//! All crate code logs through `tracing`. The binary (and tests that want
//! output) install a subscriber here. `RUST_LOG` overrides the configured
//! level when set.

use crate::config::LoggingConfig;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global subscriber. Calling it again is a no-op.
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        // Another subscriber may already be installed by the host process.
        let _ = if config.json_format {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
    });
}
