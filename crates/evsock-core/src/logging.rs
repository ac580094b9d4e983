//! Tracing subscriber setup
//!
//! The library only emits `tracing` events. Binaries and tests that want to
//! see them call [`init`] once; the filter comes from `EVSOCK_LOG`, then
//! `RUST_LOG`, then defaults to `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::env::env_first;

static INIT: Once = Once::new();

/// Default filter when no environment override is present
pub const DEFAULT_FILTER: &str = "info";

/// Install a global fmt subscriber. Later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let directives = env_first(&["EVSOCK_LOG", "RUST_LOG"])
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        // Another subscriber may already be installed by the host.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
