//! Service entry point.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use atelier_service::{create_router, AppState, ServiceConfig};
use atelier_store::PgStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env();

    let store = match PgStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to the database");
            std::process::exit(1);
        }
    };

    if let Err(e) = store.migrate().await {
        tracing::error!(error = %e, "Migrations failed");
        std::process::exit(1);
    }

    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(Arc::new(store), config);
    let router = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %listen_addr, "Failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %listen_addr, "atelier-service listening");

    if let Err(e) = axum::serve(listener, router).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
