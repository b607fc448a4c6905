use anyhow::Result;
use tracing::info;

use rill::{logging, NodeConfig};
use rill_server::RillServer;

use crate::args::ServeArgs;

pub async fn start_node(args: &ServeArgs, log_level: &str) -> Result<()> {
    let config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    let level = log_level.parse().unwrap_or(tracing::Level::INFO);
    logging::setup_global_logging(&level, true)?;

    info!(
        "Starting node '{}' (control {}, runtime {})",
        config.name, config.control_addr, config.rt_addr
    );

    let server = RillServer::new(config).await?;
    server.run().await
}
