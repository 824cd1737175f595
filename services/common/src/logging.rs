//! Tracing bootstrap shared by service binaries

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with an environment filter
///
/// `RUST_LOG` overrides the default of `<service>=info`. Logs go to stderr so
/// that binaries can use stdout for data.
pub fn init_tracing(service_name: &str) -> Result<()> {
    let default_filter = format!("{}=info", service_name.replace('-', "_"));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))
}
