//! Tracing setup for embedders and tests.

use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
