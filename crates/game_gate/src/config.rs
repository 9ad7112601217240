//! Configuration management for the game gate.
//!
//! Loads the TOML file, applies CLI overrides, validates, and converts into
//! the runtime's typed [`RuntimeConfig`].

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use game_runtime::store::default_shard_count;
use game_runtime::{HttpConfig, RuntimeConfig, SocketConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli::CliArgs;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub socket: SocketSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub status: StatusSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    pub bind_address: String,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketSettings {
    pub bind_address: String,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
    /// Sessions with no decoded frame for this long are closed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Whether to use SO_REUSEPORT for multi-threaded accept loops (Linux only)
    #[serde(default)]
    pub use_reuse_port: bool,
}

/// Write-behind store sizing and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// 0 means ten shards per CPU core
    #[serde(default)]
    pub shard_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
    #[serde(default = "default_shard_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSettings {
    /// Status log period in seconds (0 to disable)
    #[serde(default = "default_status_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

fn default_handler_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_reap_interval() -> u64 {
    1000
}

fn default_shard_idle_timeout() -> u64 {
    120
}

fn default_status_interval() -> u64 {
    60
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            handler_timeout_secs: default_handler_timeout(),
        }
    }
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8081".to_string(),
            handler_timeout_secs: default_handler_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            use_reuse_port: false,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            shard_count: 0,
            queue_capacity: default_queue_capacity(),
            flush_interval_ms: default_flush_interval(),
            reap_interval_ms: default_reap_interval(),
            idle_timeout_secs: default_shard_idle_timeout(),
        }
    }
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_status_interval(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn apply_overrides(&mut self, args: &CliArgs) {
        if let Some(address) = &args.http_address {
            self.http.bind_address = address.clone();
        }
        if let Some(address) = &args.socket_address {
            self.socket.bind_address = address.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Checks addresses, timeouts and the log level.
    pub fn validate(&self) -> Result<(), String> {
        for (name, address) in [
            ("HTTP", &self.http.bind_address),
            ("socket", &self.socket.bind_address),
        ] {
            if address.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid {name} bind address: {address}"));
            }
        }

        if self.http.handler_timeout_secs == 0 || self.socket.handler_timeout_secs == 0 {
            return Err("Handler timeouts must be at least one second".to_string());
        }
        if self.socket.idle_timeout_secs == 0 {
            return Err("Socket idle timeout must be at least one second".to_string());
        }
        if self.store.queue_capacity == 0 {
            return Err("Store queue capacity cannot be zero".to_string());
        }
        if self.store.flush_interval_ms == 0 || self.store.reap_interval_ms == 0 {
            return Err("Store flush and reap intervals cannot be zero".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    pub fn to_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let shard_count = match self.store.shard_count {
            0 => default_shard_count(),
            n => n,
        };
        Ok(RuntimeConfig {
            http: HttpConfig {
                bind_address: self
                    .http
                    .bind_address
                    .parse()
                    .context("invalid HTTP bind address")?,
                handler_timeout: Duration::from_secs(self.http.handler_timeout_secs),
            },
            socket: SocketConfig {
                bind_address: self
                    .socket
                    .bind_address
                    .parse()
                    .context("invalid socket bind address")?,
                handler_timeout: Duration::from_secs(self.socket.handler_timeout_secs),
                idle_timeout: Duration::from_secs(self.socket.idle_timeout_secs),
                use_reuse_port: self.socket.use_reuse_port,
            },
            store: StoreConfig {
                shard_count,
                queue_capacity: self.store.queue_capacity,
                flush_interval: Duration::from_millis(self.store.flush_interval_ms),
                reap_interval: Duration::from_millis(self.store.reap_interval_ms),
                idle_timeout: Duration::from_secs(self.store.idle_timeout_secs),
            },
            status_interval: Duration::from_secs(self.status.interval_secs),
        })
    }
}
