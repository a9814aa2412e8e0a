//! Tally server entry point.

use clap::Parser;
use tally_lib::cli::{self, ServerCli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ServerCli::parse();
    cli::run_server(cli).await?;
    Ok(())
}
