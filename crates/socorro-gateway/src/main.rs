use anyhow::Result;
use clap::Parser;
use socorro_gateway::{init_tracing, run_gateway_server, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level);
    let config = cli.server_config()?;
    run_gateway_server(config).await
}
