use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use hub_server::chat::listeners;
use hub_server::config::{generate_config_template, Config};
use hub_server::routes;
use hub_server::state::AppState;
use hub_server::store::Backend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hub_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Hub server v{} starting", env!("CARGO_PKG_VERSION"));

    // The store is required: refuse to serve without it
    let backend = Backend::connect(&config.store_url).await.map_err(|e| {
        tracing::error!(store_url = %config.store_url, error = %e, "Store unreachable");
        e
    })?;
    tracing::info!(store_url = %config.store_url, "Connected to store");

    let state = AppState::new(backend, config.hub_settings());

    // Subscribe the well-known fan-out topics before accepting connections
    let fanout = listeners::spawn_topic_listeners(&state).await?;
    tracing::info!("Started {} fan-out listeners", fanout.len());

    let app = routes::build_router(state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
