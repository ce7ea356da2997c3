use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::server::routes::{create_router, AppState};

pub async fn start_server(listen_addr: &str, state: AppState) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    tracing::info!("Starting camera orchestrator on {}", addr);
    tracing::info!("Control channel at ws://{}/ws", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    serve(listener, state).await
}

/// Serves on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    state.sessions.spawn_watchers();

    let app = create_router(state).layer(TraceLayer::new_for_http());

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
