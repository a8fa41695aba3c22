//! Server configuration

use anyhow::Result;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

/// Environment variable consulted for the authorized user ID.
pub const USER_ID_ENV: &str = "VEIL_USER_ID";

/// User ID applied when no well-formed ID is configured anywhere.
///
/// Deliberately permissive so a first run works out of the box; the
/// startup warning is the only guard. Operators are expected to set
/// their own ID before exposing the relay.
pub const FALLBACK_USER_ID: Uuid = match Uuid::try_parse("7d46f3a1-9c5e-4b7a-a1de-0f28c43519e7") {
    Ok(id) => id,
    Err(_) => panic!("invalid fallback user ID"),
};

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ListenConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl ServerConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve the authorized user ID from the config file, the
    /// environment, or the permissive fallback.
    pub fn user_id(&self) -> Uuid {
        let env_value = std::env::var(USER_ID_ENV).ok();
        resolve_user_id(self.auth.user_id.as_deref(), env_value.as_deref())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ListenConfig::default(),
            auth: AuthConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Resolve the authorized user ID.
///
/// The config file value wins over the environment. A missing or
/// malformed value falls back to [`FALLBACK_USER_ID`] with a warning
/// instead of aborting startup.
pub fn resolve_user_id(configured: Option<&str>, env_value: Option<&str>) -> Uuid {
    match configured.or(env_value) {
        Some(raw) => match Uuid::parse_str(raw.trim()) {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    "configured user ID {:?} is not a valid UUID ({}), using fallback {}",
                    raw, err, FALLBACK_USER_ID
                );
                FALLBACK_USER_ID
            }
        },
        None => {
            warn!("no user ID configured, using fallback {}", FALLBACK_USER_ID);
            FALLBACK_USER_ID
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Request path serving the WebSocket upgrade
    #[serde(default = "default_tunnel_path")]
    pub tunnel_path: String,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:25388".parse().unwrap()
}

fn default_tunnel_path() -> String {
    "/tunnel".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tunnel_path: default_tunnel_path(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Authorized user ID (canonical UUID string)
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    "0.0.0.0:9090".parse().unwrap()
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: default_true(),
        }
    }
}
