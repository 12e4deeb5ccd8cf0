//! Tracing subscriber bootstrap.

use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber.
///
/// `RUST_LOG` wins over `level` when set. Returns false if a global
/// subscriber was already installed, so calling this more than once is harmless.
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
