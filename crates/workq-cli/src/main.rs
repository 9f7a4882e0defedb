mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Seed { payload, payload_file, files, callid, parent } => {
            commands::seed(payload, payload_file, files, callid, parent).await
        }
        Command::Recover { timeout } => commands::recover(timeout).await,
        Command::Show { id } => commands::show(id).await,
    }
}
