//! HTTP front end: JSON API plus a server-sent event stream per session.

pub mod api;
pub mod sse;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use api::{AppState, SharedState, api_router};

use crate::config::StagegateConfig;
use crate::janitor;
use crate::pipeline::Engine;

/// Build the application router around an engine.
pub fn build_router(engine: Arc<Engine>) -> Router {
    api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(AppState { engine }))
}

/// Serve the API until Ctrl+C.
pub async fn start_server(config: &StagegateConfig, engine: Arc<Engine>) -> Result<()> {
    let server = &config.toml.server;

    let janitor = config.toml.janitor.idle_timeout().map(|idle| {
        let interval = std::time::Duration::from_secs(config.toml.janitor.sweep_interval_secs);
        tracing::info!(idle_secs = idle.as_secs(), "idle session janitor enabled");
        tokio::spawn(janitor::run_periodic(
            engine.store().clone(),
            engine.events().clone(),
            idle,
            interval,
        ))
    });

    let resumed = engine
        .resume_interrupted()
        .await
        .context("Failed to resume interrupted sessions")?;
    if !resumed.is_empty() {
        println!("Resumed {} interrupted session(s)", resumed.len());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    println!("stagegate listening on http://{}", local_addr);

    axum::serve(listener, build_router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(handle) = janitor {
        handle.abort();
    }
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
