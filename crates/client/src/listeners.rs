//! Per-event subscriber sets.
//!
//! Handlers run synchronously on the task that delivers the event. A handler
//! that panics is logged and skipped; the remaining handlers still run.

use std::{
    any::Any,
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use {serde_json::Value, tracing::error};

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;
pub type AnyHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle returned by every registration; used to remove that one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    events: Mutex<HashMap<String, Vec<Entry>>>,
    any: Mutex<Vec<(ListenerId, AnyHandler)>>,
}

/// Lock a registry table, recovering it if a previous holder panicked.
/// Handlers never run under these locks, so the table itself is consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn insert(&self, event: &str, handler: Handler, once: bool) -> ListenerId {
        let id = self.next();
        lock(&self.events)
            .entry(event.to_string())
            .or_default()
            .push(Entry { id, handler, once });
        id
    }

    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.insert(event, Arc::new(handler), false)
    }

    /// Register a handler removed after its first delivery.
    pub fn once(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.insert(event, Arc::new(handler), true)
    }

    /// Register an observer of every event delivered through [`Self::dispatch_any`].
    pub fn on_any(&self, handler: impl Fn(&str, &Value) + Send + Sync + 'static) -> ListenerId {
        let id = self.next();
        lock(&self.any).push((id, Arc::new(handler) as AnyHandler));
        id
    }

    /// Remove one handler, or every handler of `event` when `id` is `None`.
    /// Returns how many were removed.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        let mut events = lock(&self.events);
        let Some(entries) = events.get_mut(event) else {
            return 0;
        };
        let before = entries.len();
        match id {
            Some(id) => entries.retain(|e| e.id != id),
            None => entries.clear(),
        }
        let removed = before - entries.len();
        if entries.is_empty() {
            events.remove(event);
        }
        removed
    }

    pub fn off_any(&self, id: ListenerId) -> bool {
        let mut any = lock(&self.any);
        let before = any.len();
        any.retain(|(i, _)| *i != id);
        any.len() != before
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.events).get(event).map_or(0, Vec::len)
    }

    /// Deliver `data` to every handler registered for `event`.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &str, data: &Value) -> usize {
        let handlers: Vec<Handler> = {
            let mut events = lock(&self.events);
            let Some(entries) = events.get_mut(event) else {
                return 0;
            };
            let handlers = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
            entries.retain(|e| !e.once);
            if entries.is_empty() {
                events.remove(event);
            }
            handlers
        };
        for handler in &handlers {
            guarded(event, || handler(data));
        }
        handlers.len()
    }

    /// Deliver to the catch-all observers.
    pub fn dispatch_any(&self, event: &str, data: &Value) {
        let observers: Vec<AnyHandler> = lock(&self.any)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for observer in &observers {
            guarded(event, || observer(event, data));
        }
    }
}

fn guarded(event: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(event, panic = panic_message(panic.as_ref()), "listener panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
