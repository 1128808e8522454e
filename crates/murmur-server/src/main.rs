use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use murmur_gateway::tasks::{TaskIntervals, spawn_background_tasks};
use murmur_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let server = murmur_server::build(&config)?;

    let cancel = CancellationToken::new();
    let tasks = spawn_background_tasks(
        server.engine.clone(),
        TaskIntervals {
            stats: config.stats_interval,
            ..TaskIntervals::default()
        },
        cancel.clone(),
    );

    let addr = config.addr()?;
    info!("Murmur listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, server.router)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    tasks.await?;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        return cancel.cancelled().await;
    }
    info!("Shutdown requested");
    cancel.cancel();
}
