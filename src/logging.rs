use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Fallback filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,totd_sync=info,sqlx=warn";

/// Installs the global fmt subscriber with an env filter.
///
/// `RUST_LOG` wins over `default_filter`. Every subcommand of the CLI goes
/// through here so log lines share target/file/line formatting.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
