//! In-process producers behind the request handlers.
//!
//! Each store owns its data, stamps what it hands out, and publishes the
//! matching broadcast on the [`EventBus`] after every write.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::broadcast::EventBus;

pub mod logs;
pub mod models;
pub mod presets;
pub mod router;

pub use {
    logs::LogStore,
    models::ModelStore,
    presets::{PresetStore, parse_ini, render_ini},
    router::{LocalRouter, RouterBackend},
};

/// Everything the method handlers can reach.
#[derive(Clone)]
pub struct GatewayServices {
    pub models: Arc<ModelStore>,
    pub logs: Arc<LogStore>,
    pub presets: Arc<PresetStore>,
    pub router: Arc<dyn RouterBackend>,
}

impl GatewayServices {
    /// In-memory stores with a simulated router.
    pub fn local(bus: &EventBus, log_capacity: usize) -> Self {
        let models = Arc::new(ModelStore::new(bus.clone()));
        let logs = Arc::new(LogStore::new(bus.clone(), log_capacity));
        let router = Arc::new(LocalRouter::new(
            Arc::clone(&models),
            Arc::clone(&logs),
            bus.clone(),
        ));
        Self {
            models,
            logs,
            presets: Arc::new(PresetStore::new()),
            router,
        }
    }

    pub fn with_router(mut self, router: Arc<dyn RouterBackend>) -> Self {
        self.router = router;
        self
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
