use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use {
    llamadash_protocol::{
        Broadcast, Entity, Model, ModelPatch, ModelStatus,
        methods::{NewModel, ScanSummary},
    },
    tracing::info,
};

use crate::{
    broadcast::EventBus,
    error::{MethodError, MethodResult},
    services::lock,
};

/// The model catalogue. Every write bumps a store-wide version so clients
/// can discard out-of-order updates.
pub struct ModelStore {
    models: Mutex<Vec<Model>>,
    /// Candidates a scan adds when they are not catalogued yet.
    discovered: Mutex<Vec<NewModel>>,
    next_id: AtomicU64,
    version: AtomicU64,
    bus: EventBus,
}

impl ModelStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            models: Mutex::new(Vec::new()),
            discovered: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            version: AtomicU64::new(0),
            bus,
        }
    }

    fn stamp(&self, model: &mut Model) {
        model.version = Some(self.version.fetch_add(1, Ordering::Relaxed) + 1);
    }

    pub fn list(&self) -> Vec<Model> {
        lock(&self.models).clone()
    }

    pub fn get(&self, id: &str) -> MethodResult<Model> {
        lock(&self.models)
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| MethodError::not_found("Model", id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<Model> {
        lock(&self.models).iter().find(|m| m.name == name).cloned()
    }

    fn insert(&self, new: NewModel) -> Model {
        let id = format!("model-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut model = Model::new(id, new.name);
        model.path = new.path;
        model.size = new.size;
        model.quantization = new.quantization;
        model.ctx_size = new.ctx_size;
        self.stamp(&mut model);
        lock(&self.models).push(model.clone());
        model
    }

    pub fn create(&self, new: NewModel) -> MethodResult<Model> {
        if new.name.trim().is_empty() {
            return Err(MethodError::InvalidParams("model name is required".into()));
        }
        let model = self.insert(new);
        info!(id = %model.id, name = %model.name, "model created");
        self.bus.publish(Broadcast::ModelCreated {
            model: model.clone(),
        });
        Ok(model)
    }

    pub fn update(&self, id: &str, patch: &ModelPatch) -> MethodResult<Model> {
        let model = {
            let mut models = lock(&self.models);
            let model = models
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| MethodError::not_found("Model", id))?;
            model.apply(patch);
            self.stamp(model);
            model.clone()
        };
        self.bus.publish(Broadcast::ModelUpdated {
            model: model.clone(),
        });
        Ok(model)
    }

    pub fn delete(&self, id: &str) -> MethodResult<String> {
        {
            let mut models = lock(&self.models);
            let index = models
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| MethodError::not_found("Model", id))?;
            models.remove(index);
        }
        info!(id, "model deleted");
        self.bus.publish(Broadcast::ModelDeleted {
            model_id: id.to_string(),
        });
        Ok(id.to_string())
    }

    /// Set the status of every model called `name` and announce it.
    /// Returns how many models matched.
    pub fn set_status(&self, name: &str, status: ModelStatus, error: Option<String>) -> usize {
        let matched = {
            let mut models = lock(&self.models);
            let mut matched = 0;
            for model in models.iter_mut().filter(|m| m.name == name) {
                model.status = status;
                model.error.clone_from(&error);
                self.stamp(model);
                matched += 1;
            }
            matched
        };
        self.bus.publish(Broadcast::ModelStatusChanged {
            model_name: name.to_string(),
            status,
            error,
        });
        matched
    }

    /// Mark everything unloaded without announcing each model; the router
    /// announces the stop as a whole.
    pub fn unload_all(&self) {
        let mut models = lock(&self.models);
        for model in models.iter_mut() {
            model.status = ModelStatus::Unloaded;
            model.error = None;
            self.stamp(model);
        }
    }

    /// Register models a scan should find.
    pub fn discover(&self, models: impl IntoIterator<Item = NewModel>) {
        lock(&self.discovered).extend(models);
    }

    /// Add every discovered model missing from the catalogue.
    pub fn scan(&self) -> ScanSummary {
        let discovered = lock(&self.discovered).clone();
        let mut added = Vec::new();
        for candidate in &discovered {
            if self.find_by_name(&candidate.name).is_none() {
                added.push(self.insert(candidate.clone()));
            }
        }
        let summary = ScanSummary {
            scanned: discovered.len() as u64,
            updated: added.len() as u64,
            total: lock(&self.models).len() as u64,
        };
        for model in added {
            self.bus.publish(Broadcast::ModelCreated { model });
        }
        info!(
            scanned = summary.scanned,
            added = summary.updated,
            "model scan complete"
        );
        self.bus.publish(Broadcast::ModelsScanned(summary));
        summary
    }
}
