//! HTTP front end: job submission and polling plus the stateless helpers.

pub mod api;
pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, middleware};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app;
use crate::config::TfgenConfig;

pub use api::{AppState, SharedState};

/// Protected API routes, open health routes and request tracing.
pub fn build_router(state: SharedState) -> Router {
    let protected = api::api_router().route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_token,
    ));
    protected
        .merge(api::public_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and block until Ctrl+C.
pub async fn start_server(config: TfgenConfig) -> Result<()> {
    let toml = &config.toml;
    let problems = toml.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    let db = app::open_db(toml)?;
    let pipeline = app::build_pipeline(toml, Some(db.clone()))?;
    let jobs = app::build_job_manager(toml, db.clone(), pipeline).await?;
    if toml.auth.api_tokens.is_empty() {
        warn!("No API tokens configured; /api/v1 is unauthenticated");
    }

    let state = Arc::new(AppState {
        jobs: jobs.clone(),
        db,
        auth: toml.auth.clone(),
        cleanup_max_age: Duration::from_secs(toml.jobs.cleanup_max_age_secs),
    });

    let mut router = build_router(state);
    if toml.server.dev_mode {
        router = router.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", toml.server.host, toml.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(
        address = %local_addr,
        providers = ?jobs.pipeline().providers().names(),
        "tfgen server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    jobs.shutdown();
    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
