//! Streamtune Server - HTTP host for the adaptive streaming engine

use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod device;
mod error;
mod settings;
mod state;

use device::{AddressBook, HttpDeviceController, RelayUrls};
use state::AppState;
use streamtune_core::{Collaborators, DeviceId, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "streamtune_server=debug,streamtune_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Streamtune Server");

    // Load configuration
    let settings = settings::load()?;
    if let Some(path) = settings::config_path() {
        info!("Configuration file: {:?}", path);
    }

    // Create engine
    let addresses = AddressBook::default();
    let controller = HttpDeviceController::new(settings.controller.clone(), addresses.clone())?;
    let relay = RelayUrls::new(&settings.relay);
    let engine = Engine::start(
        settings.engine.clone(),
        Collaborators::new(Arc::new(controller), Arc::new(relay)),
    )?;

    for seed in &settings.devices {
        let device = DeviceId::from(seed.id.as_str());
        addresses
            .insert(device.clone(), seed.host.clone(), seed.port)
            .await;
        if !engine.register_device(device, &seed.host, seed.port) {
            warn!("Duplicate device {} in configuration", seed.id);
        }
    }

    let state = AppState::new(engine.clone(), addresses);

    // Build router
    let mut app = api::create_router(state);
    if settings.server.cors_enabled {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    // Start server
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
