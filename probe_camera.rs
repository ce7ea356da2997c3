// Resolves the route to one configured camera and asks it who it is
// Run with: cargo run --bin probe_camera -- <camera_id>

use anyhow::Context;
use std::sync::Arc;

use camera_orchestrator::config::AppConfig;
use camera_orchestrator::relay::{DeviceCall, HttpDeviceTransport, StaticCredentials};
use camera_orchestrator::server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let camera_id = std::env::args()
        .nth(1)
        .context("usage: probe_camera <camera_id>")?;
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "config/orchestrator.yaml".to_string());
    let config = AppConfig::load_from_file(&config_path)?;

    if config.get_camera(&camera_id).is_none() {
        anyhow::bail!("camera {} is not in {}", camera_id, config_path);
    }

    let credentials = Arc::new(StaticCredentials::from_config(&config.cameras));
    let transport = HttpDeviceTransport::new(&config.relay, credentials)?;
    let state = AppState::build(&config, Arc::new(transport)).await?;

    println!("\n=== Route ===");
    let route = state.relay.resolve(&camera_id).await?;
    println!("{} via {}", camera_id, route);

    println!("\n=== Device info ===");
    match state.relay.identify(&camera_id).await {
        Ok(info) => println!("{}", serde_json::to_string_pretty(&info)?),
        Err(e) => eprintln!("Device info error: {}", e),
    }

    println!("\n=== PTZ position ===");
    match state.relay.invoke(&camera_id, &DeviceCall::QueryPosition).await {
        Ok(response) => println!("{}", response.body),
        Err(e) => eprintln!("Position query error: {}", e),
    }

    Ok(())
}
