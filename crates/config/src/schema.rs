use std::time::Duration;

use {
    llamadash_protocol::{
        CONNECT_WAIT_MS, DEFAULT_PORT, DEFAULT_WS_PATH, HANDSHAKE_TIMEOUT_MS, LOG_CAPACITY,
        REQUEST_TIMEOUT_MS,
    },
    serde::{Deserialize, Serialize},
};

/// Root configuration (`llamadash.toml` / `.yaml` / `.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Path of the WebSocket endpoint.
    pub ws_path: String,
    /// Frames queued per connected client before new frames are dropped.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.into(),
            outbound_buffer: 512,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Per-client queue capacity; a configured `0` means one slot.
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_buffer.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub request_timeout_ms: u64,
    /// How long a request waits for a connection before failing.
    pub connect_wait_ms: u64,
    /// How long the connector waits for the server hello after the upgrade.
    pub handshake_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:{DEFAULT_PORT}{DEFAULT_WS_PATH}"),
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            connect_wait_ms: CONNECT_WAIT_MS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Retry policy after an unexpected close or a failed open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Retries before giving up. `0` disables reconnection.
    pub attempts: u32,
    pub delay_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay_ms: 1_000,
            delay_max_ms: 5_000,
        }
    }
}

impl ReconnectConfig {
    /// Linear backoff: `delay * attempt`, capped at `delay_max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self
            .delay_ms
            .saturating_mul(u64::from(attempt.max(1)))
            .min(self.delay_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Entries kept in the log cache and in the gateway's ring.
    pub capacity: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            capacity: LOG_CAPACITY,
        }
    }
}
