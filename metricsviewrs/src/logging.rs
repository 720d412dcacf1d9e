//! Tracing subscriber setup for binaries and tests embedding the engine.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Install a fmt subscriber filtered by `METRICSVIEW_LOG` (defaults to `info`).
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env("METRICSVIEW_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));
        // Another subscriber may already be installed by the host process.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
