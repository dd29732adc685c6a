use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use data_access_service::http;
use data_access_service::{Config, DataAccessService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "data_access_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Data Access Service v0.1.0");

    let config = Config::from_env()?;
    info!("Configuration loaded:");
    info!("  HTTP Port: {}", config.http_port);
    info!("  Storage Bucket: {}", config.object_storage.bucket);
    info!("  Engine Pool Size: {}", config.pool_size);

    let service = Arc::new(DataAccessService::new(config.clone()).await?);
    info!("Data access service initialized successfully");

    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = http::router(service);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    info!("Data Access Service started successfully");
    info!("HTTP server listening on {}", addr);

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal, gracefully shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    server_handle.abort();

    info!("Data Access Service shutdown complete");
    Ok(())
}
