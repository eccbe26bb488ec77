//! Main Entrypoint for the Podcast Studio API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the realtime session manager.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and stopping every session on shutdown.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use studio_api::{
    config::Config,
    router::{cors_layer, create_router},
    state::AppState,
};
use studio_realtime::RealtimeManager;
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    if config.openai_api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; clients must send their own api_key");
    }

    // --- 3. Initialize the Session Manager ---
    let manager = Arc::new(
        RealtimeManager::new(config.manager_config())
            .context("Failed to build realtime session manager")?,
    );

    let app_state = Arc::new(AppState {
        manager: manager.clone(),
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = cors_layer(&config.allowed_origin)?;
    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        model = %config.realtime_model,
        voice = %config.voice,
        allowed_origin = %config.allowed_origin,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    manager.shutdown().await;
    info!("Server has shut down.");
    Ok(())
}
