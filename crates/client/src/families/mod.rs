//! Concrete caches, one per server-owned collection.

use std::sync::Arc;

use {llamadash_protocol::Broadcast, tracing::warn};

use crate::transport::ListenerGuard;

pub mod logs;
pub mod models;
pub mod presets;
pub mod router;

pub use {logs::LogsCache, models::ModelsCache, presets::PresetsCache, router::RouterStatusCache};

/// Decode each of `names` into a [`Broadcast`] before handing it to
/// `handler`. Malformed payloads are logged and dropped.
pub(crate) fn on_broadcasts(
    guard: &mut ListenerGuard,
    names: &[&'static str],
    handler: impl Fn(Broadcast) + Send + Sync + 'static,
) {
    let handler = Arc::new(handler);
    for &name in names {
        let handler = Arc::clone(&handler);
        guard.on(name, move |data| match Broadcast::parse(name, data) {
            Some(Ok(broadcast)) => handler(broadcast),
            Some(Err(e)) => warn!(event = name, error = %e, "malformed broadcast dropped"),
            None => {},
        });
    }
}
