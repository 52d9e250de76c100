use std::sync::{Arc, Mutex};

use {
    async_trait::async_trait,
    llamadash_protocol::{
        Broadcast, ModelStatus, RouterState, RouterStatus,
        methods::{ModelLoadState, RouterSettings},
    },
    tracing::info,
};

use crate::{
    broadcast::EventBus,
    error::{MethodError, MethodResult},
    services::{LogStore, ModelStore, lock},
};

const DEFAULT_ROUTER_PORT: u16 = 8080;

/// The inference router process as seen by the request handlers.
#[async_trait]
pub trait RouterBackend: Send + Sync {
    async fn status(&self) -> RouterStatus;
    async fn start(&self) -> MethodResult<RouterStatus>;
    async fn stop(&self) -> MethodResult<RouterStatus>;

    async fn restart(&self) -> MethodResult<RouterStatus> {
        self.stop().await?;
        self.start().await
    }

    async fn load(&self, model_name: &str) -> MethodResult<ModelLoadState>;
    async fn unload(&self, model_name: &str) -> MethodResult<ModelLoadState>;
    async fn configure(&self, settings: RouterSettings) -> MethodResult<RouterSettings>;
}

/// A router that only tracks state. Start and stop take effect at once and
/// loads never touch a real process.
pub struct LocalRouter {
    state: Mutex<RouterStatus>,
    settings: Mutex<RouterSettings>,
    port: u16,
    models: Arc<ModelStore>,
    logs: Arc<LogStore>,
    bus: EventBus,
}

impl LocalRouter {
    pub fn new(models: Arc<ModelStore>, logs: Arc<LogStore>, bus: EventBus) -> Self {
        Self {
            state: Mutex::new(RouterStatus::idle()),
            settings: Mutex::new(RouterSettings::default()),
            port: DEFAULT_ROUTER_PORT,
            models,
            logs,
            bus,
        }
    }

    pub fn settings(&self) -> RouterSettings {
        lock(&self.settings).clone()
    }

    fn snapshot(&self) -> RouterStatus {
        lock(&self.state).clone()
    }

    fn publish_status(&self, status: &RouterStatus) {
        self.bus.publish(Broadcast::RouterStatusChanged(status.clone()));
    }

    fn known_model(&self, model_name: &str) -> MethodResult<()> {
        self.models
            .find_by_name(model_name)
            .map(|_| ())
            .ok_or_else(|| MethodError::not_found("Model", model_name))
    }

    fn require_running(&self) -> MethodResult<()> {
        if lock(&self.state).is_running() {
            Ok(())
        } else {
            Err(MethodError::Unavailable("llama-server not running".into()))
        }
    }
}

#[async_trait]
impl RouterBackend for LocalRouter {
    async fn status(&self) -> RouterStatus {
        self.snapshot()
    }

    async fn start(&self) -> MethodResult<RouterStatus> {
        let status = {
            let mut state = lock(&self.state);
            if state.is_running() {
                return Ok(state.clone());
            }
            *state = RouterStatus {
                status: RouterState::Running,
                port: Some(self.port),
                url: Some(format!("http://127.0.0.1:{}", self.port)),
                mode: Some("router".into()),
                loaded_models: Vec::new(),
                error: None,
            };
            state.clone()
        };
        info!(port = self.port, "router started");
        self.logs
            .info(format!("llama-server started on port {}", self.port));
        self.publish_status(&status);
        Ok(status)
    }

    async fn stop(&self) -> MethodResult<RouterStatus> {
        let status = RouterStatus::idle();
        *lock(&self.state) = status.clone();
        self.models.unload_all();
        info!("router stopped");
        self.logs.info("llama-server stopped");
        self.publish_status(&status);
        self.bus.publish(Broadcast::RouterStopped {});
        Ok(status)
    }

    async fn load(&self, model_name: &str) -> MethodResult<ModelLoadState> {
        self.require_running()?;
        self.known_model(model_name)?;
        let status = {
            let mut state = lock(&self.state);
            if !state.loaded_models.iter().any(|m| m == model_name) {
                let limit = lock(&self.settings).max_models_loaded;
                if let Some(limit) = limit
                    && state.loaded_models.len() >= limit as usize
                {
                    return Err(MethodError::Unavailable(format!(
                        "max models loaded ({limit})"
                    )));
                }
                state.loaded_models.push(model_name.to_string());
            }
            state.clone()
        };
        self.models
            .set_status(model_name, ModelStatus::Loaded, None);
        self.logs.info(format!("model loaded: {model_name}"));
        self.publish_status(&status);
        Ok(ModelLoadState {
            model_name: model_name.to_string(),
            status: ModelStatus::Loaded,
        })
    }

    async fn unload(&self, model_name: &str) -> MethodResult<ModelLoadState> {
        self.require_running()?;
        self.known_model(model_name)?;
        let status = {
            let mut state = lock(&self.state);
            state.loaded_models.retain(|m| m != model_name);
            state.clone()
        };
        self.models
            .set_status(model_name, ModelStatus::Unloaded, None);
        self.logs.info(format!("model unloaded: {model_name}"));
        self.publish_status(&status);
        Ok(ModelLoadState {
            model_name: model_name.to_string(),
            status: ModelStatus::Unloaded,
        })
    }

    async fn configure(&self, settings: RouterSettings) -> MethodResult<RouterSettings> {
        *lock(&self.settings) = settings.clone();
        info!(?settings, "router settings updated");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, llamadash_protocol::methods::NewModel};

    fn router() -> (LocalRouter, Arc<ModelStore>, EventBus) {
        let bus = EventBus::new();
        let models = Arc::new(ModelStore::new(bus.clone()));
        let logs = Arc::new(LogStore::new(bus.clone(), 50));
        let router = LocalRouter::new(Arc::clone(&models), logs, bus.clone());
        (router, models, bus)
    }

    fn add(models: &ModelStore, name: &str) {
        models
            .create(NewModel {
                name: name.into(),
                ..NewModel::default()
            })
            .unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (router, ..) = router();
        let first = router.start().await.unwrap();
        assert!(first.is_running());
        assert_eq!(first.url.as_deref(), Some("http://127.0.0.1:8080"));
        assert_eq!(router.start().await.unwrap(), first);
    }

    #[tokio::test]
    async fn load_requires_running_router() {
        let (router, models, _) = router();
        add(&models, "llama");
        let err = router.load("llama").await.unwrap_err();
        assert_eq!(err.to_string(), "llama-server not running");

        router.start().await.unwrap();
        assert!(router.load("ghost").await.is_err());
        let state = router.load("llama").await.unwrap();
        assert_eq!(state.status, ModelStatus::Loaded);
        assert_eq!(router.status().await.loaded_models, vec!["llama"]);
        assert_eq!(
            models.find_by_name("llama").unwrap().status,
            ModelStatus::Loaded
        );
    }

    #[tokio::test]
    async fn load_respects_max_models() {
        let (router, models, _) = router();
        add(&models, "a");
        add(&models, "b");
        router
            .configure(RouterSettings {
                max_models_loaded: Some(1),
                ..RouterSettings::default()
            })
            .await
            .unwrap();
        router.start().await.unwrap();
        router.load("a").await.unwrap();
        assert!(matches!(
            router.load("b").await.unwrap_err(),
            MethodError::Unavailable(_)
        ));
        router.unload("a").await.unwrap();
        router.load("b").await.unwrap();
    }

    #[tokio::test]
    async fn stop_unloads_and_announces() {
        let (router, models, bus) = router();
        add(&models, "llama");
        router.start().await.unwrap();
        router.load("llama").await.unwrap();

        let mut rx = bus.subscribe();
        let status = router.stop().await.unwrap();
        assert_eq!(status.status, RouterState::Idle);
        assert_eq!(
            models.find_by_name("llama").unwrap().status,
            ModelStatus::Unloaded
        );

        let mut saw_stopped = false;
        while let Ok(event) = rx.try_recv() {
            saw_stopped |= matches!(event, Broadcast::RouterStopped {});
        }
        assert!(saw_stopped);
    }

    #[tokio::test]
    async fn restart_runs_stop_then_start() {
        let (router, ..) = router();
        router.start().await.unwrap();
        let status = router.restart().await.unwrap();
        assert!(status.is_running());
    }
}
