//! Connection state machine and cache resync on reconnect.
//!
//! Raw transport events are folded into [`Signal`]s and fed through
//! [`transition`]. Caches are marked stale only when a connected session is
//! lost, and resynced only on the edge back into `Connected`. Transport
//! chatter such as retries and failed opens never reaches subscribers.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicU64, Ordering},
};

use {
    async_trait::async_trait,
    futures::future::join_all,
    llamadash_protocol::{Broadcast, events},
    tokio::sync::{broadcast, watch},
    tracing::{debug, info, warn},
};

use crate::{
    Result,
    transport::{ListenerGuard, Transport},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// `connect()` was called.
    ConnectRequested,
    Opened,
    Closed,
    OpenFailed,
    RetryScheduled,
    GaveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Entered `Connected`: resync caches and notify subscribers.
    NotifyEstablished,
    /// Left `Connected`: cached data may be outdated.
    MarkStale,
}

/// The transition table.
pub fn transition(state: ConnectionState, signal: Signal) -> (ConnectionState, Option<Effect>) {
    use {ConnectionState::*, Signal::*};

    match (state, signal) {
        (Connected, Opened) => (Connected, None),
        (_, Opened) => (Connected, Some(Effect::NotifyEstablished)),
        (Connected, Closed | GaveUp) => (Disconnected, Some(Effect::MarkStale)),
        (_, Closed | GaveUp) => (Disconnected, None),
        (Disconnected, ConnectRequested | RetryScheduled) => (Connecting, None),
        (Connecting, OpenFailed) => (Connecting, None),
        (current, _) => (current, None),
    }
}

/// A cache the coordinator keeps in step with the connection.
#[async_trait]
pub trait Resync: Send + Sync {
    fn name(&self) -> &'static str;

    fn mark_stale(&self);

    /// Reload from the server.
    async fn resync(&self) -> Result<()>;
}

/// Sent once per `Disconnected → Connected` edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Established {
    pub conn_id: Option<String>,
    /// Counts establishments since the coordinator was created.
    pub epoch: u64,
}

pub struct Coordinator {
    transport: Weak<Transport>,
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    caches: Mutex<Vec<Arc<dyn Resync>>>,
    established: broadcast::Sender<Established>,
    /// Client id from the server's `connection:established` reply.
    server_ack: Mutex<Option<String>>,
    listeners: Mutex<Option<ListenerGuard>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Coordinator {
    pub fn attach(transport: &Arc<Transport>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (established, _) = broadcast::channel(16);
        let coordinator = Arc::new(Self {
            transport: Arc::downgrade(transport),
            state,
            epoch: AtomicU64::new(0),
            caches: Mutex::new(Vec::new()),
            established,
            server_ack: Mutex::new(None),
            listeners: Mutex::new(None),
        });

        let mut guard = ListenerGuard::new(transport);
        for (event, signal) in [
            (events::CONNECT, Signal::Opened),
            (events::DISCONNECT, Signal::Closed),
            (events::CONNECT_ERROR, Signal::OpenFailed),
            (events::RECONNECT_ATTEMPT, Signal::RetryScheduled),
            (events::RECONNECT_FAILED, Signal::GaveUp),
        ] {
            let weak = Arc::downgrade(&coordinator);
            guard.on(event, move |_| {
                if let Some(c) = weak.upgrade() {
                    c.signal(signal);
                }
            });
        }
        let weak = Arc::downgrade(&coordinator);
        guard.on(events::CONNECTION_ESTABLISHED, move |data| {
            let Some(c) = weak.upgrade() else { return };
            match Broadcast::parse(events::CONNECTION_ESTABLISHED, data) {
                Some(Ok(Broadcast::ConnectionEstablished { client_id, .. })) => {
                    debug!(client_id = %client_id, "server acknowledged connection");
                    *lock(&c.server_ack) = Some(client_id);
                },
                _ => warn!("malformed connection:established"),
            }
        });
        *lock(&coordinator.listeners) = Some(guard);
        coordinator
    }

    pub fn register(&self, cache: Arc<dyn Resync>) {
        lock(&self.caches).push(cache);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Established> {
        self.established.subscribe()
    }

    pub fn server_ack(&self) -> Option<String> {
        lock(&self.server_ack).clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Feed one signal through the table and run its effect.
    pub fn signal(self: &Arc<Self>, signal: Signal) {
        let mut effect = None;
        self.state.send_if_modified(|state| {
            let (next, e) = transition(*state, signal);
            effect = e;
            let changed = next != *state;
            if changed {
                debug!(from = ?*state, to = ?next, ?signal, "connection state");
            }
            *state = next;
            changed
        });

        match effect {
            Some(Effect::MarkStale) => {
                *lock(&self.server_ack) = None;
                for cache in self.caches() {
                    cache.mark_stale();
                }
            },
            Some(Effect::NotifyEstablished) => self.on_established(),
            None => {},
        }
    }

    fn caches(&self) -> Vec<Arc<dyn Resync>> {
        lock(&self.caches).clone()
    }

    fn on_established(self: &Arc<Self>) {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_id = self.transport.upgrade().and_then(|t| t.id());
        info!(conn_id = conn_id.as_deref().unwrap_or("-"), epoch, "connection established");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.resync_all().await });

        let _ = self.established.send(Established { conn_id, epoch });
    }

    /// Resync every registered cache concurrently. Returns how many failed.
    pub async fn resync_all(&self) -> usize {
        let caches = self.caches();
        let results = join_all(caches.iter().map(|c| c.resync())).await;
        let mut failed = 0;
        for (cache, result) in caches.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                warn!(cache = cache.name(), error = %e, "resync failed");
            }
        }
        failed
    }
}
