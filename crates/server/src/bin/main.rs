//! distlab server binary.
//!
//! Serves the WebSocket session endpoint on the port named by `PORT`
//! (default 8080). SIGINT/SIGTERM trigger graceful session teardown.

use distlab_server::ws::{create_router, AppState};
use distlab_server::{Broadcaster, Hub, SessionManager};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let hub = Arc::new(Hub::new());
    let manager = SessionManager::new(Arc::clone(&hub) as Arc<dyn Broadcaster>);
    let state = AppState {
        hub,
        manager: Arc::clone(&manager),
    };

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;

    info!(port, "listening");
    info!("WebSocket endpoint: ws://localhost:{port}/ws");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(manager: Arc<SessionManager>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("shutting down");
    manager.stop();
}
