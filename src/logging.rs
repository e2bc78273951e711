//! Subscriber setup for binaries and demos.
//!
//! The library only emits `tracing` events. Call [`init`] once from `main`
//! to print them; the filter comes from `GPU_TENANT_LOG` (same syntax as
//! `RUST_LOG`), defaulting to `info`.

use std::sync::Once;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// ENV used to set the log filter
pub const FILTER_ENV: &str = "GPU_TENANT_LOG";

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

/// Install a compact stderr subscriber. Later calls do nothing.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

        let layer = fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr);

        // Another subscriber may already be installed by the host program.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}
