use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jetmirror_engine::StreamSupervisor;
use jetmirror_server::{LineFeed, ServerConfig};
use jetmirror_store::{PgCursorStore, PgRecordStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    info!("Starting jetmirror-server");

    let config = ServerConfig::parse();
    config.log_redacted();

    let engine_config = config.engine_config();
    engine_config
        .validate_against_pool(config.database_max_connections)
        .context("Invalid engine configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    info!(max_connections = config.database_max_connections, "Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Migrations complete");

    let supervisor = StreamSupervisor::new(
        LineFeed::new(config.feed_addr.clone()),
        PgRecordStore::new(pool.clone()),
        PgCursorStore::new(pool.clone(), config.stream_name.clone()),
        engine_config,
    );
    let stats = supervisor.run(shutdown_signal()).await?;

    pool.close().await;
    info!("Materializer stopped. {stats}");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received, draining");
}
