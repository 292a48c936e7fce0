//! Centralized configuration for the pipe transport.

use std::time::Duration;

/// Transport-wide limits and timings.
pub struct TransportConfig;

impl TransportConfig {
    /// Largest frame (type byte + body) accepted from the wire.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// How long a client waits for a server to accept its connection.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Pause between connection attempts while every pipe instance is busy.
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

    /// How long a client whose request write failed waits for the server's own status.
    pub const STATUS_GRACE_PERIOD: Duration = Duration::from_millis(100);

    /// Concurrent connections one server accepts before rejecting new ones.
    pub const MAX_CONNECTIONS: usize = 254;

    pub const DEFAULT_PIPE_NAME: &'static str = "grpc-pipes";
}

/// Per-server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_connections: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: TransportConfig::MAX_CONNECTIONS,
        }
    }
}
