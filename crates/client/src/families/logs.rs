use std::{
    ops::Deref,
    sync::{Arc, Weak},
};

use {
    async_trait::async_trait,
    llamadash_protocol::{
        Broadcast, LogEntry, events,
        methods::{LogsClear, NoParams},
    },
    serde_json::json,
};

use crate::{
    Result,
    cache::{Collection, DomainCache},
    coordinator::Resync,
    families::on_broadcasts,
    rpc::Correlator,
    transport::ListenerGuard,
};

pub const LOGS: Collection = Collection {
    family: "log entry",
    list_event: events::LOGS_GET,
    list_field: "logs",
};

/// The most recent log entries, newest first, capped at `capacity`.
pub struct LogsCache {
    cache: DomainCache<LogEntry>,
    capacity: usize,
    _listeners: ListenerGuard,
}

impl LogsCache {
    pub fn new(rpc: Arc<Correlator>, capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let mut listeners = ListenerGuard::new(rpc.transport());
            let weak = weak.clone();
            on_broadcasts(&mut listeners, &[events::LOGS_ENTRY], move |broadcast| {
                if let (Some(this), Broadcast::LogAppended { entry }) = (weak.upgrade(), broadcast)
                {
                    this.push(entry);
                }
            });
            Self {
                cache: DomainCache::new(LOGS, rpc),
                capacity,
                _listeners: listeners,
            }
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a new entry, dropping the oldest beyond capacity.
    pub fn push(&self, entry: LogEntry) -> bool {
        self.cache.upsert_front(entry, self.capacity)
    }

    /// Load the newest `capacity` entries.
    pub async fn refresh(&self) -> Result<Arc<Vec<LogEntry>>> {
        self.cache
            .refresh_with(json!({ "limit": self.capacity }))
            .await
    }

    /// Clear the server's log buffer, then the local copy. Returns how many
    /// entries the server dropped.
    pub async fn clear(&self) -> Result<usize> {
        let cleared = self.cache.rpc().call::<LogsClear>(&NoParams {}).await?;
        self.cache.replace_all(Vec::new());
        Ok(cleared.cleared)
    }
}

impl Deref for LogsCache {
    type Target = DomainCache<LogEntry>;

    fn deref(&self) -> &DomainCache<LogEntry> {
        &self.cache
    }
}

#[async_trait]
impl Resync for LogsCache {
    fn name(&self) -> &'static str {
        "logs"
    }

    fn mark_stale(&self) {
        self.cache.mark_stale();
    }

    async fn resync(&self) -> Result<()> {
        self.refresh().await.map(drop)
    }
}
