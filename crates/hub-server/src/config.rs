use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use hub_gateway::GatewayConfig;

const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// Lifetime of issued bearer tokens.
    pub token_ttl_hours: i64,
    /// Largest inbound WebSocket frame, in bytes.
    pub max_frame_bytes: usize,
    /// Per-session outbound queue capacity.
    pub outbound_buffer: usize,
    pub heartbeat_secs: u64,
    pub write_timeout_secs: u64,
}

impl ServerConfig {
    /// Load from `HUB_*` environment variables, after reading `.env` if
    /// present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ServerConfig {
            host: env::var("HUB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: var_or("HUB_PORT", "8083")
                .parse()
                .context("Invalid HUB_PORT")?,
            db_path: PathBuf::from(var_or("HUB_DB_PATH", "connecthub.db")),
            jwt_secret: var_or("HUB_JWT_SECRET", DEV_SECRET),
            token_ttl_hours: var_or("HUB_TOKEN_TTL_HOURS", "720")
                .parse()
                .context("Invalid HUB_TOKEN_TTL_HOURS")?,
            max_frame_bytes: var_or("HUB_MAX_FRAME_BYTES", "10000")
                .parse()
                .context("Invalid HUB_MAX_FRAME_BYTES")?,
            outbound_buffer: var_or("HUB_OUTBOUND_BUFFER", "256")
                .parse()
                .context("Invalid HUB_OUTBOUND_BUFFER")?,
            heartbeat_secs: var_or("HUB_HEARTBEAT_SECS", "54")
                .parse()
                .context("Invalid HUB_HEARTBEAT_SECS")?,
            write_timeout_secs: var_or("HUB_WRITE_TIMEOUT_SECS", "10")
                .parse()
                .context("Invalid HUB_WRITE_TIMEOUT_SECS")?,
        };

        if config.jwt_secret == DEV_SECRET {
            warn!("HUB_JWT_SECRET is not set; using the development secret");
        }
        anyhow::ensure!(config.heartbeat_secs > 0, "HUB_HEARTBEAT_SECS must be positive");
        anyhow::ensure!(config.write_timeout_secs > 0, "HUB_WRITE_TIMEOUT_SECS must be positive");

        Ok(config)
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.token_ttl_hours)
    }
}

/// Loopback on an ephemeral port, for embedding and tests.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            db_path: PathBuf::from("connecthub.db"),
            jwt_secret: DEV_SECRET.to_string(),
            token_ttl_hours: 720,
            max_frame_bytes: 10_000,
            outbound_buffer: 256,
            heartbeat_secs: 54,
            write_timeout_secs: 10,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
