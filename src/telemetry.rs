//! Tracing setup.
//!
//! `BRAID_LOG` overrides the configured filter (same directive syntax as
//! `RUST_LOG`). Init is idempotent: a second call is a no-op so tests and
//! embedders cannot fight over the global subscriber.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

pub fn init(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("BRAID_LOG")
        .unwrap_or_else(|_| EnvFilter::new(logging.filter.clone()));
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init();
    });
}

pub fn is_test_env() -> bool {
    std::env::var_os("RUST_TEST_THREADS").is_some()
}
