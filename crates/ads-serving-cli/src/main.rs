use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_logging();
    let cli = ads_serving_cli::Cli::parse();
    ads_serving_cli::run_cli(cli)
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("ADS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
