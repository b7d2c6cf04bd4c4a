use std::io;

use clap::Parser;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use controller::config::Config;
use controller::controller::State;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let collector = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .json()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    collector.init();

    controller::controller::run(State { config }).await?;

    Ok(())
}
