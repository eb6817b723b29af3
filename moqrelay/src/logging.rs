//! Logging setup

use crate::RelayError;
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `filter` (e.g. `"moqrelay_core=debug"`)
///
/// `RUST_LOG` takes precedence when set. Fails if a global subscriber is
/// already installed.
pub fn init_logging(filter: &str) -> Result<(), RelayError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| RelayError::Config {
            reason: format!("Invalid log filter '{}': {}", filter, e),
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| RelayError::Config {
            reason: format!("Failed to install log subscriber: {}", e),
        })
}
