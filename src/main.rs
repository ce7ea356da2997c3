use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camera_orchestrator::config::AppConfig;
use camera_orchestrator::relay::{HttpDeviceTransport, StaticCredentials};
use camera_orchestrator::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camera_orchestrator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting camera orchestrator");

    // Load configuration
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "config/orchestrator.yaml".to_string());

    let config = AppConfig::load_from_file(&config_path)
        .context("Failed to load configuration")?;

    tracing::info!("Loaded configuration with {} cameras", config.cameras.len());
    match &config.relay.cloud_url {
        Some(url) => tracing::info!("Cloud relay at {}", url),
        None => tracing::warn!("No cloud relay configured; only local routes are usable"),
    }

    let credentials = Arc::new(StaticCredentials::from_config(&config.cameras));
    let transport = HttpDeviceTransport::new(&config.relay, credentials)
        .context("Failed to build device transport")?;

    let state = AppState::build(&config, Arc::new(transport))
        .await
        .context("Failed to seed camera registry")?;

    server::start_server(&config.server.listen_address, state).await?;

    Ok(())
}
