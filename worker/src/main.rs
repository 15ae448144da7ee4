mod config;
mod runner;
mod worker;

use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    worker::run(WorkerConfig::from_env()).await
}
