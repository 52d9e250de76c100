use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    llamadash_config::ServerConfig,
    tokio::sync::{RwLock, mpsc},
};

use crate::{broadcast::EventBus, services::GatewayServices};

// ── Connected client ─────────────────────────────────────────────────────────

pub struct ConnectedClient {
    pub conn_id: String,
    /// Bounded channel for sending serialized frames to this client's write loop.
    pub sender: mpsc::Sender<String>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectedClient {
    pub fn new(
        conn_id: impl Into<String>,
        sender: mpsc::Sender<String>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id: conn_id.into(),
            sender,
            connected_at: now,
            last_activity: now,
            remote_addr,
        }
    }

    /// Send a serialized JSON frame to this client.
    ///
    /// Uses `try_send` to avoid blocking; drops the frame if the client's
    /// outbound buffer is full (slow consumer protection).
    pub fn send(&self, frame: &str) -> bool {
        self.sender.try_send(frame.to_string()).is_ok()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

// ── Inner state ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct GatewayInner {
    pub clients: HashMap<String, ConnectedClient>,
}

impl GatewayInner {
    /// Insert a client, returning the new client count.
    pub fn register_client(&mut self, client: ConnectedClient) -> usize {
        let conn_id = client.conn_id.clone();
        self.clients.insert(conn_id, client);
        self.clients.len()
    }

    /// Remove a client by conn_id. Returns the removed client and the new count.
    pub fn remove_client(&mut self, conn_id: &str) -> (Option<ConnectedClient>, usize) {
        let removed = self.clients.remove(conn_id);
        (removed, self.clients.len())
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in `Arc` for use across async tasks.
pub struct GatewayState {
    pub version: String,
    pub config: ServerConfig,
    pub services: GatewayServices,
    /// Producers publish broadcasts here; the fan-out task delivers them.
    pub bus: EventBus,
    pub started_at: Instant,
    /// Monotonically increasing sequence counter for broadcast events.
    pub seq: AtomicU64,
    pub inner: RwLock<GatewayInner>,
}

impl GatewayState {
    pub fn new(config: ServerConfig, services: GatewayServices, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config,
            services,
            bus,
            started_at: Instant::now(),
            seq: AtomicU64::new(0),
            inner: RwLock::new(GatewayInner::default()),
        })
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn register_client(&self, client: ConnectedClient) {
        let count = self.inner.write().await.register_client(client);

        #[cfg(feature = "metrics")]
        metrics::gauge!("llamadash_gateway_connected_clients").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        let (removed, count) = self.inner.write().await.remove_client(conn_id);

        #[cfg(feature = "metrics")]
        metrics::gauge!("llamadash_gateway_connected_clients").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;

        removed
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn touch_client(&self, conn_id: &str) {
        if let Some(client) = self.inner.write().await.clients.get_mut(conn_id) {
            client.touch();
        }
    }
}
