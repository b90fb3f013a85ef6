// Application configuration
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Credentials and addressing supplied by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub local_port: u16,
}

impl Default for UserConfig {
    fn default() -> Self {
        UserConfig {
            username: String::new(),
            password: String::new(),
            domain: String::new(),
            proxy_host: String::new(),
            proxy_port: 3128,
            local_port: 3129,
        }
    }
}

/// Tuning knobs with working defaults; rarely edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Send/receive buffer size for sockets toward the upstream proxy (bytes).
    pub socket_buffer_size: usize,
    /// Send/receive buffer size for accepted client sockets (bytes).
    pub server_socket_buffer_size: usize,
    /// Total cap on pooled upstream connections; unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    /// Per-route cap on pooled upstream connections; unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections_per_route: Option<usize>,
    pub eviction_enabled: bool,
    /// Period of the idle-connection eviction task (seconds).
    pub eviction_period: u64,
    /// Idle lifetime of a pooled connection without a Keep-Alive hint (seconds).
    pub max_connection_idle: u64,
    /// Whether a repeatable request is re-sent once after a stale-connection failure.
    pub retries: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            socket_buffer_size: 16 * 1024,
            server_socket_buffer_size: 16 * 1024,
            max_connections: None,
            max_connections_per_route: None,
            eviction_enabled: true,
            eviction_period: 30,
            max_connection_idle: 30,
            retries: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub user: UserConfig,
    pub system: SystemConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!("Configuration not found, using default values");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&content)?;

        tracing::info!("Configuration loaded from {:?}", config_path);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to find configuration directory"))?;

        Ok(config_dir.join("ntlm-proxy").join("config.toml"))
    }
}
