use std::{sync::Arc, time::Duration};

use {
    llamadash_config::ClientConfig,
    llamadash_protocol::Method,
    serde_json::Value,
    tokio::sync::broadcast,
};

use crate::{
    Result,
    coordinator::{ConnectionState, Coordinator, Established, Signal},
    families::{LogsCache, ModelsCache, PresetsCache, RouterStatusCache},
    rpc::Correlator,
    transport::{Connector, Transport},
    ws::WsConnector,
};

/// Everything a dashboard needs, wired together: one transport, one
/// correlator, the four caches, and the coordinator that resyncs them.
pub struct DashboardClient {
    transport: Arc<Transport>,
    rpc: Arc<Correlator>,
    coordinator: Arc<Coordinator>,
    models: Arc<ModelsCache>,
    logs: Arc<LogsCache>,
    presets: Arc<PresetsCache>,
    router: Arc<RouterStatusCache>,
}

impl DashboardClient {
    pub fn new(config: &ClientConfig, log_capacity: usize) -> Self {
        Self::with_connector(
            Arc::new(WsConnector::from_config(config)),
            config,
            log_capacity,
        )
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
        log_capacity: usize,
    ) -> Self {
        let transport = Transport::new(connector, config.reconnect.clone());
        let rpc = Correlator::new(
            Arc::clone(&transport),
            config.request_timeout(),
            config.connect_wait(),
        );
        let coordinator = Coordinator::attach(&transport);

        let models = ModelsCache::new(Arc::clone(&rpc));
        let logs = LogsCache::new(Arc::clone(&rpc), log_capacity);
        let presets = PresetsCache::new(Arc::clone(&rpc));
        let router = RouterStatusCache::new(Arc::clone(&rpc));
        coordinator.register(models.clone());
        coordinator.register(logs.clone());
        coordinator.register(presets.clone());
        coordinator.register(router.clone());

        Self {
            transport,
            rpc,
            coordinator,
            models,
            logs,
            presets,
            router,
        }
    }

    /// Start connecting. Caches load once the connection is established.
    pub fn connect(&self) -> &Self {
        self.coordinator.signal(Signal::ConnectRequested);
        self.transport.connect();
        self
    }

    pub fn disconnect(&self) -> &Self {
        self.transport.disconnect();
        self
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.transport.wait_connected(timeout).await
    }

    pub fn state(&self) -> ConnectionState {
        self.coordinator.state()
    }

    /// Notified once per successful (re)connection.
    pub fn established(&self) -> broadcast::Receiver<Established> {
        self.coordinator.subscribe()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn models(&self) -> &Arc<ModelsCache> {
        &self.models
    }

    pub fn logs(&self) -> &Arc<LogsCache> {
        &self.logs
    }

    pub fn presets(&self) -> &Arc<PresetsCache> {
        &self.presets
    }

    pub fn router(&self) -> &Arc<RouterStatusCache> {
        &self.router
    }

    pub async fn request(&self, event: &str, payload: Value) -> Result<Value> {
        self.rpc.request(event, payload).await
    }

    pub async fn call<M: Method>(&self, params: &M::Params) -> Result<M::Output> {
        self.rpc.call::<M>(params).await
    }

    /// Reload every cache now. Returns how many reloads failed.
    pub async fn refresh_all(&self) -> usize {
        self.coordinator.resync_all().await
    }
}

impl Drop for DashboardClient {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}
