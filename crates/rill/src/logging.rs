use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber for a node process.
///
/// The filter defaults to `level` for everything and can be overridden with
/// `RUST_LOG` as usual.
pub fn setup_global_logging(level: &tracing::Level, with_ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::builder().parse(format!("{},rill={}", level, level))
            .unwrap_or_else(|_| EnvFilter::new("info")));

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_ansi(with_ansi)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
