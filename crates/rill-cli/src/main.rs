use anyhow::Result;
use clap::Parser;

mod args;
mod commands;
mod serve;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(ref serve_args) => serve::start_node(serve_args, &cli.log_level).await,
        other => commands::execute(cli.address, other).await,
    }
}
