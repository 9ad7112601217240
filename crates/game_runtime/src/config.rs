//! Runtime configuration types and defaults.
//!
//! The binary builds a [`RuntimeConfig`] from its own file and CLI formats;
//! the runtime only ever sees these typed values.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::store::StoreConfig;

/// HTTP transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub bind_address: SocketAddr,
    /// Deadline for routes that don't set their own.
    pub handler_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            handler_timeout: Duration::from_secs(10),
        }
    }
}

/// Socket (WebSocket session) transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    pub bind_address: SocketAddr,
    pub handler_timeout: Duration,
    /// A session with no decoded frame for this long is closed.
    pub idle_timeout: Duration,
    /// Whether to use SO_REUSEPORT with one accept loop per CPU core
    pub use_reuse_port: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 8081)),
            handler_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            use_reuse_port: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    pub http: HttpConfig,
    pub socket: SocketConfig,
    pub store: StoreConfig,
    /// Period of the status log line. Zero disables it.
    pub status_interval: Duration,
}

impl RuntimeConfig {
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_distinct_local_ports() {
        let config = RuntimeConfig::default();
        assert_eq!(config.http.bind_address.port(), 8080);
        assert_eq!(config.socket.bind_address.port(), 8081);
        assert!(config.http.bind_address.ip().is_loopback());
        assert!(!config.socket.use_reuse_port);
        assert_eq!(config.status_interval, Duration::ZERO);
        assert_eq!(config.store.queue_capacity, 1024);
    }
}
