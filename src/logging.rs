#![forbid(unsafe_code)]

use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "tubegrab=info,tower_http=info";

/// Installs the global fmt subscriber. `RUST_LOG` wins over the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
