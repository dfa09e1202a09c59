//! TOML configuration: listener, mapping store and backend allow-list

use crate::admission::AdmissionPolicy;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// Mapping store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backend hosts that may be registered through the control plane
    #[serde(default)]
    pub allow: AllowConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 10500)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Root domain; requests for `<label>.<domain>` are routed by label
    pub domain: String,

    /// Max seconds to wait for backend response headers (default: disabled)
    pub request_timeout_secs: Option<u64>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Token required by the `/api` control plane. Open when unset.
    pub admin_token: Option<String>,
}

impl ServerConfig {
    pub fn new(domain: &str) -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            domain: domain.to_string(),
            request_timeout_secs: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            admin_token: None,
        }
    }

    /// Listen address built from `bind` (IPv4 or IPv6 literal) and `port`
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.bind.trim().parse().map_err(|e| {
            anyhow::anyhow!("server.bind '{}' is not an IP address: {}", self.bind, e)
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Which engine backs the mapping store
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    /// SQLite database (default)
    #[default]
    Sqlite,
    /// Volatile in-process map
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Storage engine: "sqlite" (default) or "memory"
    #[serde(default)]
    pub engine: StorageEngine,

    /// SQLite database path (default: ":memory:")
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: StorageEngine::default(),
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AllowConfig {
    /// Exact IP literals (e.g. "127.0.0.1")
    #[serde(default)]
    pub ips: Vec<String>,

    /// CIDR networks (e.g. "192.168.0.0/24")
    #[serde(default)]
    pub networks: Vec<String>,

    /// Exact hostnames (e.g. "localhost")
    #[serde(default)]
    pub hosts: Vec<String>,
}

// Default value functions
fn default_listen_port() -> u16 {
    10500
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_db_path() -> String {
    crate::store::MEMORY_PATH.to_string()
}

impl Config {
    /// Minimal configuration for the given root domain
    pub fn new(domain: &str) -> Self {
        Self {
            server: ServerConfig::new(domain),
            storage: StorageConfig::default(),
            allow: AllowConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let domain = self.server.domain.trim();
        if domain.is_empty() {
            errors.push("server.domain is required".to_string());
        } else if domain.contains(|c: char| c.is_whitespace() || c == '/' || c == ':') {
            errors.push(format!("server.domain '{}' is not a valid domain", domain));
        }

        if let Err(e) = self.server.bind_addr() {
            errors.push(e.to_string());
        }

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }

        if self.server.request_timeout_secs == Some(0) {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }

        if self.storage.engine == StorageEngine::Sqlite && self.storage.path.trim().is_empty() {
            errors.push("storage.path must not be empty".to_string());
        }

        if let Err(e) = AdmissionPolicy::from_config(&self.allow) {
            errors.push(format!("allow: {}", e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
