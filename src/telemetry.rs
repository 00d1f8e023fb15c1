//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! embedder's call. [`init`] is the convenience used by binaries and tests:
//! an fmt subscriber filtered by `RUST_LOG` (default `info`), installed at
//! most once per process.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the default subscriber; safe to call repeatedly.
pub fn init() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    });
}
