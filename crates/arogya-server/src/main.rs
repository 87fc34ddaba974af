//! # arogya-server
//!
//! Real-time chat service for the ArogyaPath platform.
//!
//! This binary provides:
//! - **Session gateway** over WebSocket: token authentication, joining
//!   private and group conversations, and live message delivery
//! - **Ordered, durable message log** per conversation in SQLite, with
//!   cursor-based history for catch-up
//! - **REST API** (axum) for conversation management and history reads

mod api;
mod auth;
mod config;
mod db;
mod dispatcher;
mod error;
mod gateway;
mod locks;
mod message_store;
mod registry;
mod rooms;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use arogya_store::Database;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::db::SharedDb;
use crate::gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,arogya_server=debug")),
        )
        .init();

    info!("Starting ArogyaPath chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.auth_service_pubkey == [0u8; 32] {
        tracing::warn!("AUTH_SERVICE_PUBKEY is not set; every session token will be rejected");
    }

    // -----------------------------------------------------------------------
    // 3. Open the database and build the gateway
    // -----------------------------------------------------------------------
    let database = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?database.path(), "Database ready");

    let gateway = Gateway::new(SharedDb::new(database), &config);
    let app_state = AppState {
        gateway: gateway.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Session token cache cleanup (every 10 minutes)
    let verifier = gateway.verifier.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            verifier.purge_expired().await;
        }
    });

    // Idle per-conversation lock slots and cached rooms (every 5 minutes)
    let housekeeping = gateway.clone();
    let cache_idle = config.room_cache_idle;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let evicted = housekeeping.rooms.evict_idle(cache_idle);
            let rooms = housekeeping.rooms.prune_locks();
            let ordering = housekeeping.dispatcher.prune_locks();
            debug!(
                evicted,
                cached = housekeeping.rooms.cached_count(),
                rooms,
                ordering,
                connections = housekeeping.registry.connection_count(),
                "Housekeeping pass"
            );
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
