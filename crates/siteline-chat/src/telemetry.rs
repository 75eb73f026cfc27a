//! Tracing setup for hosts embedding the chat core.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "SITELINE_LOG";

const DEFAULT_FILTER: &str = "info";

/// Install a fmt subscriber filtered by `SITELINE_LOG` (default `info`).
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true)
        .try_init();
    if installed.is_ok() {
        tracing::debug!("Tracing initialized");
    }
}
