use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;

use furnace::cli::{self, Cli};
use furnace::monitoring::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenv().ok();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config.log_level, cli.verbose)?;

    cli::run(cli, config).await
}
