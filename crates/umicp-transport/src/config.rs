//! Configuration for channels, servers, peers, and pools.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one client-side [`crate::TransportChannel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Endpoint to connect to, e.g. `ws://127.0.0.1:20081`
    pub url: String,
    /// Reconnect automatically after failures and queue sends while down
    pub auto_reconnect: bool,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Attempt limit before a connect fails for good
    pub max_reconnect_attempts: u32,
    /// Liveness frame interval; zero disables the heartbeat
    pub heartbeat_interval: Duration,
    /// Deadline for one connection attempt
    pub connection_timeout: Duration,
    /// Request permessage-deflate on the underlying socket
    pub compression: bool,
}

impl ChannelConfig {
    /// Config for the given endpoint with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:20081".to_string(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            compression: true,
        }
    }
}

/// Configuration for a listening [`crate::ChannelServer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port; zero asks the OS for a free port
    pub port: u16,
    /// Upper bound on one inbound frame
    pub max_payload: usize,
}

impl ServerConfig {
    /// Bind address in `host:port` form.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 20081,
            max_payload: 100 * 1024 * 1024,
        }
    }
}

/// Configuration for a [`crate::MultiplexedPeer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Run the hello/handshake_complete exchange automatically on connect
    pub auto_protocol: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            auto_protocol: true,
        }
    }
}

/// Configuration for a [`crate::ConnectionPool`].
///
/// `min_size` is silently clamped to `max_size` at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Address every pooled connection targets
    pub address: String,
    /// Connections created eagerly and kept through cleanup
    pub min_size: usize,
    /// Hard cap on tracked connections
    pub max_size: usize,
    /// Age past which a connection is stale and discarded by validation
    pub max_age: Duration,
    /// Idle span past which cleanup evicts an available connection
    pub idle_timeout: Duration,
    /// Default deadline for [`crate::ConnectionPool::acquire`]
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// Pool config for the given address with default sizing.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            min_size: 2,
            max_size: 10,
            max_age: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Set pool bounds, clamping `min_size` to `max_size`.
    pub fn with_sizes(mut self, min_size: usize, max_size: usize) -> Self {
        self.max_size = max_size;
        self.min_size = min_size.min(max_size);
        self
    }

    pub(crate) fn clamped(mut self) -> Self {
        if self.min_size > self.max_size {
            self.min_size = self.max_size;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_defaults_match_protocol_timings() {
        let config = ChannelConfig::default();
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn pool_config_clamps_min_to_max() {
        let config = PoolConfig::new("ws://localhost:1").with_sizes(10, 3);
        assert_eq!(config.min_size, 3);
        assert_eq!(config.max_size, 3);

        let config = PoolConfig {
            min_size: 8,
            max_size: 4,
            ..PoolConfig::new("ws://localhost:1")
        }
        .clamped();
        assert_eq!(config.min_size, 4);
    }

    #[test]
    fn server_bind_address_formats_host_and_port() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
            ..ServerConfig::default()
        };
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
    }
}
