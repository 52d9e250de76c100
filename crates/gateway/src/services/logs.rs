use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use llamadash_protocol::{Broadcast, LogEntry, LogLevel, now_ms};

use crate::{broadcast::EventBus, services::lock};

/// Bounded in-memory log, newest first. Every append is broadcast as
/// `logs:entry`.
pub struct LogStore {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    next_id: AtomicU64,
    bus: EventBus,
}

impl LogStore {
    pub fn new(bus: EventBus, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            next_id: AtomicU64::new(0),
            bus,
        }
    }

    pub fn append(&self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            level,
            message: message.into(),
            timestamp: now_ms(),
        };
        {
            let mut entries = lock(&self.entries);
            entries.push_front(entry.clone());
            entries.truncate(self.capacity);
        }
        self.bus.publish(Broadcast::LogAppended {
            entry: entry.clone(),
        });
        entry
    }

    pub fn info(&self, message: impl Into<String>) -> LogEntry {
        self.append(LogLevel::Info, message)
    }

    pub fn error(&self, message: impl Into<String>) -> LogEntry {
        self.append(LogLevel::Error, message)
    }

    /// Up to `limit` entries, newest first. `None` returns everything kept.
    pub fn recent(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let limit = limit.unwrap_or(self.capacity);
        lock(&self.entries).iter().take(limit).cloned().collect()
    }

    /// Drop every entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = lock(&self.entries);
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn keeps_newest_within_capacity() {
        let store = LogStore::new(EventBus::new(), 3);
        for i in 1..=5 {
            store.info(format!("line {i}"));
        }
        let messages: Vec<_> = store
            .recent(None)
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["line 5", "line 4", "line 3"]);
        assert_eq!(store.recent(Some(1)).len(), 1);
    }

    #[tokio::test]
    async fn append_is_broadcast() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let store = LogStore::new(bus, 10);
        let entry = store.error("router crashed");

        let Broadcast::LogAppended { entry: sent } = rx.recv().await.unwrap() else {
            panic!("expected log entry");
        };
        assert_eq!(sent, entry);
        assert_eq!(sent.level, LogLevel::Error);
    }

    #[test]
    fn clear_reports_count() {
        let store = LogStore::new(EventBus::new(), 10);
        store.info("a");
        store.info("b");
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert_eq!(store.clear(), 0);
    }
}
