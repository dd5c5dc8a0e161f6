//! Tracing subscriber setup for the binary.

use crate::error::{PaymentError, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `default_level` when set. Stdout stays reserved for
/// the balance report.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| PaymentError::Config(format!("invalid log level: {e}")))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .map_err(|e| PaymentError::Config(format!("tracing already initialised: {e}")))
}
