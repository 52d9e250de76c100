use std::{ops::Deref, sync::Arc};

use {
    async_trait::async_trait,
    llamadash_protocol::{
        Preset, events,
        entity::PresetSections,
        methods::{
            CreatePreset, PresetEnvelope, PresetRef, PresetsCreate, PresetsDelete, PresetsRead,
            PresetsSave, SavePreset,
        },
    },
    tracing::warn,
};

use crate::{
    Error, Result,
    cache::{Collection, DomainCache},
    coordinator::Resync,
    rpc::Correlator,
};

pub const PRESETS: Collection = Collection {
    family: "preset",
    list_event: events::PRESETS_LIST,
    list_field: "presets",
};

/// Router presets. The server never pushes preset changes, so this cache
/// only moves on request results.
pub struct PresetsCache {
    cache: DomainCache<Preset>,
}

impl PresetsCache {
    pub fn new(rpc: Arc<Correlator>) -> Arc<Self> {
        Arc::new(Self {
            cache: DomainCache::new(PRESETS, rpc),
        })
    }

    pub async fn read(&self, name: &str) -> Result<Preset> {
        let PresetEnvelope { preset } = self
            .cache
            .rpc()
            .call::<PresetsRead>(&PresetRef {
                filename: name.to_string(),
            })
            .await?;
        self.cache.upsert(preset.clone());
        Ok(preset)
    }

    pub async fn save(&self, name: &str, config: PresetSections) -> Result<Preset> {
        let params = SavePreset {
            filename: name.to_string(),
            config,
        };
        let preset = self.cache.rpc().call::<PresetsSave>(&params).await?;
        self.cache.upsert(preset.clone());
        Ok(preset)
    }

    pub async fn create(&self, name: &str, description: Option<String>) -> Result<Preset> {
        let params = CreatePreset {
            filename: name.to_string(),
            description,
        };
        let preset = self.cache.rpc().call::<PresetsCreate>(&params).await?;
        self.cache.upsert(preset.clone());
        Ok(preset)
    }

    /// Remove locally first. A failed delete reloads the list from the
    /// server instead of guessing what survived.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let id = name.to_string();
        if !self.cache.remove(&id) {
            return Err(Error::not_found(PRESETS.family, name));
        }
        let params = PresetRef { filename: id };
        match self.cache.rpc().call::<PresetsDelete>(&params).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Err(reload) = self.cache.refresh().await {
                    warn!(preset = name, error = %reload, "preset reload after failed delete");
                }
                Err(e)
            },
        }
    }
}

impl Deref for PresetsCache {
    type Target = DomainCache<Preset>;

    fn deref(&self) -> &DomainCache<Preset> {
        &self.cache
    }
}

#[async_trait]
impl Resync for PresetsCache {
    fn name(&self) -> &'static str {
        "presets"
    }

    fn mark_stale(&self) {
        self.cache.mark_stale();
    }

    async fn resync(&self) -> Result<()> {
        self.cache.refresh().await.map(drop)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::test_support::connected,
        serde_json::json,
        std::collections::BTreeMap,
    };

    fn preset(name: &str, ctx: &str) -> serde_json::Value {
        json!({
            "name": name,
            "file": format!("{name}.ini"),
            "parameters": { "*": { "ctx-size": ctx } },
            "raw": format!("[*]\nctx-size = {ctx}\n"),
        })
    }

    #[tokio::test]
    async fn save_merges_returned_preset() {
        let (rpc, server) = connected().await;
        let presets = PresetsCache::new(rpc);
        let _serving = server.serve(|frame, _| match frame.event.as_str() {
            events::PRESETS_LIST => Some(Ok(json!({ "presets": [preset("fast", "2048")] }))),
            events::PRESETS_SAVE => Some(Ok(preset("fast", "4096"))),
            _ => None,
        });
        presets.refresh().await.unwrap();

        let mut config = BTreeMap::new();
        config.insert(
            "*".to_string(),
            BTreeMap::from([("ctx-size".to_string(), "4096".to_string())]),
        );
        let saved = presets.save("fast", config).await.unwrap();
        assert_eq!(saved.parameters["*"]["ctx-size"], "4096");
        assert_eq!(presets.len(), 1);
        assert_eq!(
            presets.get(&"fast".into()).unwrap().parameters["*"]["ctx-size"],
            "4096"
        );
    }

    #[tokio::test]
    async fn failed_delete_reloads_list() {
        let (rpc, server) = connected().await;
        let presets = PresetsCache::new(rpc);
        let _serving = server.serve(|frame, _| match frame.event.as_str() {
            events::PRESETS_LIST => Some(Ok(json!({
                "presets": [preset("fast", "2048"), preset("slow", "8192")],
            }))),
            events::PRESETS_DELETE => Some(Err("permission denied".into())),
            _ => None,
        });
        presets.refresh().await.unwrap();

        let err = presets.delete("slow").await.unwrap_err();
        assert_eq!(err.to_string(), "permission denied");
        assert!(presets.contains(&"slow".into()));

        let err = presets.delete("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { family: "preset", .. }));
    }

    #[tokio::test]
    async fn create_adds_to_list() {
        let (rpc, server) = connected().await;
        let presets = PresetsCache::new(rpc);
        let _serving = server.serve(|frame, _| {
            assert_eq!(frame.data["description"], "scratch");
            Some(Ok(preset("scratch", "512")))
        });
        let created = presets
            .create("scratch", Some("scratch".into()))
            .await
            .unwrap();
        assert_eq!(created.file, "scratch.ini");
        assert!(presets.contains(&"scratch".into()));
    }
}
