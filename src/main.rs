mod auth;
mod cancellation;
mod cli;
mod config;
mod domain;
mod error;
mod output;
mod policy;
mod providers;
mod schedules;
mod store;
#[cfg(test)]
mod test_support;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting ci-autocancel");
    cli.execute().await?;

    Ok(())
}
