//! Tally agent entry point.

use clap::Parser;
use mimalloc::MiMalloc;
use tally_lib::agent::CountingAllocator;
use tally_lib::cli::{self, AgentCli};

#[global_allocator]
static GLOBAL: CountingAllocator<MiMalloc> = CountingAllocator::new(MiMalloc);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = AgentCli::parse();
    cli::run_agent(cli, &GLOBAL).await?;
    Ok(())
}
