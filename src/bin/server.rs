use clap::Parser;
use likestream::env::{Env, setup_tracing};
use likestream::launch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Env::parse().into_config();
    setup_tracing(&config.log_level);

    launch(config).await
}
