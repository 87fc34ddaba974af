//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use arogya_shared::constants::{DEFAULT_HTTP_PORT, MAX_HISTORY_PAGE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file. `None` uses the platform data directory.
    /// Env: `DATABASE_PATH`
    pub database_path: Option<PathBuf>,

    /// Ed25519 public key of the auth service that signs session tokens
    /// (hex-encoded, 64 chars).
    /// Env: `AUTH_SERVICE_PUBKEY`
    /// Default: all-zeros, which rejects every token (development only).
    pub auth_service_pubkey: [u8; 32],

    /// Connections with no inbound frame for this long are disconnected.
    /// Env: `IDLE_TIMEOUT_SECS`
    /// Default: `60`
    pub idle_timeout: Duration,

    /// Interval between server pings; must be shorter than `idle_timeout`.
    /// Env: `HEARTBEAT_INTERVAL_SECS`
    /// Default: `20`
    pub heartbeat_interval: Duration,

    /// Upper bound on waiting for a message write before `DeliveryFailed`.
    /// Env: `PERSIST_TIMEOUT_MS`
    /// Default: `5000`
    pub persist_timeout: Duration,

    /// Largest page the history endpoint will return.
    /// Env: `HISTORY_PAGE_LIMIT`
    /// Default: `200`
    pub history_page_limit: u32,

    /// Cached conversations not read for this long are dropped by the
    /// housekeeping task.
    /// Env: `ROOM_CACHE_IDLE_SECS`
    /// Default: `1800`
    pub room_cache_idle: Duration,

    /// Human-readable name for this instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            auth_service_pubkey: [0u8; 32],
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            persist_timeout: Duration::from_millis(5000),
            history_page_limit: MAX_HISTORY_PAGE,
            room_cache_idle: Duration::from_secs(1800),
            instance_name: "ArogyaPath Chat".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Invalid values are logged
    /// and the default is kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(hex_key) = lookup("AUTH_SERVICE_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.auth_service_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid AUTH_SERVICE_PUBKEY, using default (dev-only)"
                    );
                }
            }
        }

        if let Some(secs) = parse_positive(&lookup, "IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_positive(&lookup, "HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_positive(&lookup, "PERSIST_TIMEOUT_MS") {
            config.persist_timeout = Duration::from_millis(ms);
        }

        if let Some(limit) = parse_positive(&lookup, "HISTORY_PAGE_LIMIT") {
            config.history_page_limit = limit.min(u64::from(MAX_HISTORY_PAGE)) as u32;
        }

        if let Some(secs) = parse_positive(&lookup, "ROOM_CACHE_IDLE_SECS") {
            config.room_cache_idle = Duration::from_secs(secs);
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if config.heartbeat_interval >= config.idle_timeout {
            let adjusted = config.idle_timeout / 3;
            tracing::warn!(
                heartbeat = ?config.heartbeat_interval,
                idle = ?config.idle_timeout,
                adjusted = ?adjusted,
                "Heartbeat interval must be shorter than the idle timeout"
            );
            config.heartbeat_interval = adjusted;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid positive integer, using default");
            None
        }
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_pubkey(hex: &str) -> Result<[u8; 32], String> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex.len()));
    }

    let bytes = hex::decode(hex).map_err(|e| e.to_string())?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
