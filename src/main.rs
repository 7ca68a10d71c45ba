//! TrustGate - session and trust layer for the task API

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trustgate_backend::{
    api::{build_router, AppState},
    config::Config,
    maintenance::spawn_maintenance,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment and logging
    load_env();
    init_tracing();

    let config = Config::parse();

    info!("🚀 TrustGate starting");
    if config.uses_dev_secret() {
        warn!("⚠️  JWT_SECRET not set - using the development secret");
    }

    let state = AppState::open(&config)?;
    state
        .jwt
        .self_test()
        .context("JWT signing self-test failed")?;
    info!("🔐 Authentication initialized at: {}", config.auth_db_path);

    if let Some(password) = config.bootstrap_admin_password.as_deref() {
        state.users.bootstrap_admin(password).await?;
    }

    let maintenance = spawn_maintenance(
        state.tokens.clone(),
        state.cache.clone(),
        config.cleanup_interval(),
    );

    let broadcaster = state.broadcaster.clone();
    let app = build_router(state, &config.cors_allow_origin);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    maintenance.abort();
    broadcaster.shutdown().await;
    info!("👋 TrustGate stopped");

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("🛑 Shutdown signal received"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trustgate_backend=debug,trustgate=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
