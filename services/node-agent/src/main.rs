//! plinth - node bootstrap agent.
//!
//! `plinth init`, `plinth join` and `plinth destroy` provision or tear down
//! the local node; `plinth etcd ...` inspects the local etcd member.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
