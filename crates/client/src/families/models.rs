use std::{
    ops::Deref,
    sync::{Arc, Weak},
};

use {
    async_trait::async_trait,
    llamadash_protocol::{
        Broadcast, Model, ModelPatch, ModelStatus, events,
        methods::{
            CreateModel, Method, ModelEnvelope, ModelLoadState, ModelName, ModelRef, ModelsCreate,
            ModelsDelete, ModelsGet, ModelsLoad, ModelsScan, ModelsUnload, ModelsUpdate, NewModel,
            NoParams, ScanSummary, UpdateModel,
        },
    },
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    cache::{Collection, DomainCache},
    coordinator::Resync,
    families::on_broadcasts,
    rpc::Correlator,
    transport::ListenerGuard,
};

pub const MODELS: Collection = Collection {
    family: "model",
    list_event: events::MODELS_LIST,
    list_field: "models",
};

/// Cached model catalogue, kept current by `models:*` broadcasts.
pub struct ModelsCache {
    cache: DomainCache<Model>,
    _listeners: ListenerGuard,
}

impl ModelsCache {
    pub fn new(rpc: Arc<Correlator>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let mut listeners = ListenerGuard::new(rpc.transport());
            let weak = weak.clone();
            on_broadcasts(
                &mut listeners,
                &[
                    events::MODELS_CREATED,
                    events::MODELS_UPDATED,
                    events::MODELS_DELETED,
                    events::MODELS_STATUS,
                    events::MODELS_ROUTER_STOPPED,
                    events::MODELS_SCANNED,
                ],
                move |broadcast| {
                    if let Some(this) = weak.upgrade() {
                        this.apply_broadcast(broadcast);
                    }
                },
            );
            Self {
                cache: DomainCache::new(MODELS, rpc),
                _listeners: listeners,
            }
        })
    }

    /// Fold one server push into the cache. Returns whether the cached list
    /// changed.
    pub fn apply_broadcast(self: &Arc<Self>, broadcast: Broadcast) -> bool {
        match broadcast {
            Broadcast::ModelCreated { model } | Broadcast::ModelUpdated { model } => {
                self.cache.upsert(model)
            },
            Broadcast::ModelDeleted { model_id } => self.cache.remove(&model_id),
            Broadcast::ModelStatusChanged {
                model_name,
                status,
                error,
            } => {
                let patch = ModelPatch::status_with_error(status, error);
                self.cache.update_where(|m| m.name == model_name, &patch) > 0
            },
            Broadcast::RouterStopped {} => {
                let patch = ModelPatch::status_with_error(ModelStatus::Unloaded, None);
                self.cache.update_where(|_| true, &patch) > 0
            },
            Broadcast::ModelsScanned(summary) => {
                debug!(
                    scanned = summary.scanned,
                    updated = summary.updated,
                    "models scanned, reloading"
                );
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.cache.refresh().await {
                        warn!(error = %e, "model reload after scan failed");
                    }
                });
                false
            },
            _ => false,
        }
    }

    fn lookup(&self, id: &str) -> Result<Model> {
        self.cache
            .get(&id.to_string())
            .ok_or_else(|| Error::not_found(MODELS.family, id))
    }

    /// Fetch one model from the server and merge it in.
    pub async fn fetch(&self, id: &str) -> Result<Model> {
        let ModelEnvelope { model } = self
            .cache
            .rpc()
            .call::<ModelsGet>(&ModelRef {
                model_id: id.to_string(),
            })
            .await?;
        self.cache.upsert(model.clone());
        Ok(model)
    }

    pub async fn create(&self, model: NewModel) -> Result<Model> {
        let ModelEnvelope { model } = self
            .cache
            .rpc()
            .call::<ModelsCreate>(&CreateModel { model })
            .await?;
        self.cache.upsert(model.clone());
        Ok(model)
    }

    /// Apply `patch` locally right away, then persist it. The previous
    /// entity is restored if the server rejects the change.
    pub async fn update_remote(&self, id: &str, patch: ModelPatch) -> Result<Model> {
        let previous = self.lookup(id)?;
        self.cache.update(&previous.id, &patch);
        let params = UpdateModel {
            model_id: previous.id.clone(),
            updates: patch,
        };
        match self.cache.rpc().call::<ModelsUpdate>(&params).await {
            Ok(ModelEnvelope { model }) => {
                self.cache.upsert(model.clone());
                Ok(model)
            },
            Err(e) => {
                self.cache.upsert(previous);
                Err(e)
            },
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let model = self.lookup(id)?;
        let deleted = self
            .cache
            .rpc()
            .call::<ModelsDelete>(&ModelRef { model_id: model.id })
            .await?;
        self.cache.remove(&deleted.deleted_id);
        Ok(())
    }

    /// Ask the router to load a model. The status reads `loading` until the
    /// `models:status` broadcast reports the outcome.
    pub async fn start(&self, id: &str) -> Result<ModelLoadState> {
        self.switch::<ModelsLoad>(id, ModelStatus::Loading).await
    }

    pub async fn stop(&self, id: &str) -> Result<ModelLoadState> {
        self.switch::<ModelsUnload>(id, ModelStatus::Unloading).await
    }

    async fn switch<M>(&self, id: &str, pending: ModelStatus) -> Result<ModelLoadState>
    where
        M: Method<Params = ModelName, Output = ModelLoadState>,
    {
        let model = self.lookup(id)?;
        self.cache.update(&model.id, &ModelPatch::status(pending));
        let params = ModelName {
            model_name: model.name.clone(),
        };
        match self.cache.rpc().call::<M>(&params).await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(model = %model.name, event = M::EVENT, error = %e, "restoring model status");
                self.cache
                    .update(&model.id, &ModelPatch::status(model.status));
                Err(e)
            },
        }
    }

    /// Rescan the models directory.
    ///
    /// The gateway follows a scan with `models:scanned`, which reloads the
    /// list through [`Self::apply_broadcast`].
    pub async fn scan(&self) -> Result<ScanSummary> {
        self.cache.rpc().call::<ModelsScan>(&NoParams {}).await
    }
}

impl Deref for ModelsCache {
    type Target = DomainCache<Model>;

    fn deref(&self) -> &DomainCache<Model> {
        &self.cache
    }
}

#[async_trait]
impl Resync for ModelsCache {
    fn name(&self) -> &'static str {
        "models"
    }

    fn mark_stale(&self) {
        self.cache.mark_stale();
    }

    async fn resync(&self) -> Result<()> {
        self.cache.refresh().await.map(drop)
    }
}
