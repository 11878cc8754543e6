// =============================================================================
// Meridian Reality Market — Main Entry Point
// =============================================================================
//
// One process hosts the whole data plane: signed event ingress, scoring,
// blending, the matching engine, the admin/audit surface, and the WebSocket
// feed. Setting MERIDIAN_ORDERBOOK_URL splits the topology: the blender then
// reads market pressure from that service over HTTP instead of the local
// engine.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod audit;
mod blender;
mod broadcast;
mod ingest;
mod matching;
mod runtime_config;
mod scoring;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::store::Db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Reality Market — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG_PATH").unwrap_or_else(|_| "meridian_config.json".into());
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    let ingest_secret = std::env::var("MERIDIAN_INGEST_SECRET")
        .context("MERIDIAN_INGEST_SECRET must be set (event signature secret)")?;
    if std::env::var(api::auth::ADMIN_KEY_ENV).unwrap_or_default().is_empty() {
        warn!("{} is not set; admin endpoints will reject all requests", api::auth::ADMIN_KEY_ENV);
    }

    let db_path = std::env::var("MERIDIAN_DB_PATH").unwrap_or_else(|_| "meridian.db".into());
    let orderbook_url = std::env::var("MERIDIAN_ORDERBOOK_URL").ok().filter(|s| !s.is_empty());

    info!(
        db = %db_path,
        market_feed = %orderbook_url.as_deref().unwrap_or("local"),
        tau_hours = config.tau_hours,
        delta_cap = config.delta_cap,
        "configuration resolved"
    );

    // ── 2. Storage & shared state ────────────────────────────────────────
    let db = Arc::new(Db::open(&db_path, &config)?);
    let (state, blend_rx) = AppState::new(config, db, ingest_secret, orderbook_url);

    // ── 3. Order-book recovery ───────────────────────────────────────────
    let replayed = state.matching.recover().await?;
    info!(orders = replayed, "matching engine ready");

    // ── 4. Blend worker ──────────────────────────────────────────────────
    tokio::spawn(blender::run_blend_worker(
        state.blender.clone(),
        state.blend_scheduler.clone(),
        blend_rx,
    ));

    // ── 5. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received; stopping gracefully");
    server.abort();

    if let Err(e) = state.runtime_config.read().save(&config_path) {
        warn!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian shut down complete.");
    Ok(())
}
