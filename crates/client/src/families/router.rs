use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    llamadash_protocol::{
        Broadcast, RouterStatus, events,
        methods::{
            LlamaConfig, LlamaRestart, LlamaStart, LlamaStatus, LlamaStop, NoParams,
            RouterConfig, RouterSettings, StatusEnvelope,
        },
    },
    tokio::sync::watch,
    tracing::debug,
};

use crate::{
    Result, coordinator::Resync, families::on_broadcasts, rpc::Correlator,
    transport::ListenerGuard,
};

/// The router's status: a single value rather than a collection.
///
/// Control requests return what the server accepted, but only a
/// `llama:status` broadcast or a refresh moves the cached value.
pub struct RouterStatusCache {
    rpc: Arc<Correlator>,
    state: watch::Sender<Option<RouterStatus>>,
    stale: AtomicBool,
    _listeners: ListenerGuard,
}

impl RouterStatusCache {
    pub fn new(rpc: Arc<Correlator>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let mut listeners = ListenerGuard::new(rpc.transport());
            let weak = weak.clone();
            on_broadcasts(&mut listeners, &[events::LLAMA_STATUS], move |broadcast| {
                if let (Some(this), Broadcast::RouterStatusChanged(status)) =
                    (weak.upgrade(), broadcast)
                {
                    this.set(status);
                }
            });
            let (state, _) = watch::channel(None);
            Self {
                rpc,
                state,
                stale: AtomicBool::new(false),
                _listeners: listeners,
            }
        })
    }

    /// `None` until the first status arrives.
    pub fn get(&self) -> Option<RouterStatus> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<RouterStatus>> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state
            .borrow()
            .as_ref()
            .is_some_and(RouterStatus::is_running)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    /// Replace the cached status. Returns whether it changed.
    pub fn set(&self, status: RouterStatus) -> bool {
        self.state.send_if_modified(|current| {
            if current.as_ref() == Some(&status) {
                return false;
            }
            debug!(status = %status.status, "router status");
            *current = Some(status);
            true
        })
    }

    pub async fn refresh(&self) -> Result<RouterStatus> {
        let StatusEnvelope { status } = self.rpc.call::<LlamaStatus>(&NoParams {}).await?;
        self.set(status.clone());
        self.stale.store(false, Ordering::Relaxed);
        Ok(status)
    }

    pub async fn start(&self) -> Result<RouterStatus> {
        self.rpc.call::<LlamaStart>(&NoParams {}).await
    }

    pub async fn stop(&self) -> Result<RouterStatus> {
        self.rpc.call::<LlamaStop>(&NoParams {}).await
    }

    pub async fn restart(&self) -> Result<RouterStatus> {
        self.rpc.call::<LlamaRestart>(&NoParams {}).await
    }

    /// Persist router settings. Returns the settings the server stored.
    pub async fn configure(&self, settings: RouterSettings) -> Result<RouterSettings> {
        let stored = self
            .rpc
            .call::<LlamaConfig>(&RouterConfig { settings })
            .await?;
        Ok(stored.settings)
    }
}

#[async_trait]
impl Resync for RouterStatusCache {
    fn name(&self) -> &'static str {
        "router"
    }

    fn mark_stale(&self) {
        self.stale.store(true, Ordering::Relaxed);
    }

    async fn resync(&self) -> Result<()> {
        self.refresh().await.map(drop)
    }
}
