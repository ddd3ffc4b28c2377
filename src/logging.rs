//! Diagnostic logging.
//!
//! Operator diagnostics go through `tracing` to stderr. Project output and
//! state changes are not logged here; they go to the status sink on stdout.

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LEVEL: &str = "warn";

/// Installs the global subscriber. `RUST_LOG` wins over `level`.
pub fn init(level: Option<&str>) -> Result<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), level)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| anyhow!("failed to install logger: {}", err))
}

fn build_filter(env: Option<&str>, level: Option<&str>) -> Result<EnvFilter> {
    let directives = env
        .filter(|value| !value.trim().is_empty())
        .or(level)
        .unwrap_or(DEFAULT_LEVEL);
    EnvFilter::try_new(directives).map_err(|err| anyhow!("invalid log filter {:?}: {}", directives, err))
}
