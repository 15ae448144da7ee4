mod config;
mod dispatch;
mod error;
mod failover;
mod handlers;
mod state;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::MasterConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info")),
        )
        .init();

    let config = MasterConfig::from_env();
    let state = AppState::new(config.clone());

    // router HTTP
    let app = handlers::build_router(state.clone());

    // workers caídos, tiempo de vida y purga en segundo plano
    tokio::spawn(failover::run_failover_loop(state.clone()));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(
        worker_timeout = ?config.worker_timeout,
        auth = config.api_token.is_some(),
        "master escuchando en {}",
        listener.local_addr()?
    );

    axum::serve(listener, app).await?;
    Ok(())
}
