//! One concrete params/output pair per request event.
//!
//! The wire format stays a named event with a JSON payload; these types are
//! the validated view of that payload on both ends.

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};

use crate::{
    entity::{LogEntry, Model, ModelPatch, ModelStatus, Preset, PresetSections, RouterStatus},
    events,
};

/// A request event together with its parameter and result payload types.
pub trait Method {
    const EVENT: &'static str;
    type Params: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Treat `null` the same as an omitted field.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parameters of requests that take none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoParams {}

macro_rules! method {
    ($(#[$meta:meta])* $name:ident, $event:expr, $params:ty => $output:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl Method for $name {
            const EVENT: &'static str = $event;
            type Params = $params;
            type Output = $output;
        }
    };
}

// ── Models ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub models: Vec<Model>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEnvelope {
    pub model: Model,
}

/// Fields of a model the caller chooses; the producer assigns the id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NewModel {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateModel {
    pub model: NewModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateModel {
    pub model_id: String,
    #[serde(default)]
    pub updates: ModelPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDeleted {
    pub deleted_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelName {
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLoadState {
    pub model_name: String,
    pub status: ModelStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scanned: u64,
    pub updated: u64,
    pub total: u64,
}

method!(ModelsList, events::MODELS_LIST, NoParams => ModelList);
method!(ModelsGet, events::MODELS_GET, ModelRef => ModelEnvelope);
method!(ModelsCreate, events::MODELS_CREATE, CreateModel => ModelEnvelope);
method!(ModelsUpdate, events::MODELS_UPDATE, UpdateModel => ModelEnvelope);
method!(ModelsDelete, events::MODELS_DELETE, ModelRef => ModelDeleted);
method!(
    /// Ask the router to load a model. Completion arrives as `models:status`.
    ModelsLoad, events::MODELS_LOAD, ModelName => ModelLoadState
);
method!(ModelsUnload, events::MODELS_UNLOAD, ModelName => ModelLoadState);
method!(ModelsScan, events::MODELS_SCAN, NoParams => ScanSummary);

// ── Logs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsCleared {
    pub cleared: usize,
}

method!(LogsGet, events::LOGS_GET, LogQuery => LogList);
method!(LogsClear, events::LOGS_CLEAR, NoParams => LogsCleared);

// ── Presets ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub presets: Vec<Preset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetRef {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetEnvelope {
    pub preset: Preset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavePreset {
    pub filename: String,
    #[serde(default)]
    pub config: PresetSections,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePreset {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetDeleted {
    pub filename: String,
    pub deleted: bool,
}

method!(PresetsList, events::PRESETS_LIST, NoParams => PresetList);
method!(PresetsRead, events::PRESETS_READ, PresetRef => PresetEnvelope);
method!(PresetsSave, events::PRESETS_SAVE, SavePreset => Preset);
method!(PresetsCreate, events::PRESETS_CREATE, CreatePreset => Preset);
method!(PresetsDelete, events::PRESETS_DELETE, PresetRef => PresetDeleted);

// ── Router ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: RouterStatus,
}

/// Router settings persisted by `llama:config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_models_loaded: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    pub auto_load_models: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub settings: RouterSettings,
}

method!(LlamaStatus, events::LLAMA_STATUS, NoParams => StatusEnvelope);
method!(
    /// Start the router. The request resolves once the process is accepted;
    /// the `llama:status` broadcast carries the running state.
    LlamaStart, events::LLAMA_START, NoParams => RouterStatus
);
method!(LlamaStop, events::LLAMA_STOP, NoParams => RouterStatus);
method!(LlamaRestart, events::LLAMA_RESTART, NoParams => RouterStatus);
method!(LlamaConfig, events::LLAMA_CONFIG, RouterConfig => RouterConfig);
