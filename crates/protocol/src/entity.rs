//! Domain entities held by the client caches and produced by the gateway.

use std::{collections::BTreeMap, convert::Infallible, fmt};

use serde::{Deserialize, Deserializer, Serialize};

/// An item of a server-owned collection.
///
/// `id` is stable and unique within its collection. `apply` is a shallow
/// merge: every field present in the patch overwrites the entity's field.
pub trait Entity: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + fmt::Debug + fmt::Display + Send + Sync;
    type Patch: Send + Sync;

    fn id(&self) -> &Self::Id;

    fn apply(&mut self, patch: &Self::Patch);

    /// Server-assigned monotonic version, when the producer stamps one.
    fn version(&self) -> Option<u64> {
        None
    }
}

// ── Models ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Error,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Unloading => "unloading",
            Self::Error => "error",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: ModelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,
    /// Last error reported by the router for this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ModelStatus::default(),
            path: None,
            size: None,
            quantization: None,
            ctx_size: None,
            error: None,
            version: None,
        }
    }
}

/// Partial update of a [`Model`]. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ModelStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,
    /// `None` leaves the error alone, `Some(None)` (wire `null`) clears it.
    #[serde(
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<Option<String>>,
}

/// A present field decodes to `Some`, even when its value is `null`.
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ModelPatch {
    pub fn status(status: ModelStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Set the status and replace the error, clearing it when `error` is
    /// `None`.
    pub fn status_with_error(status: ModelStatus, error: Option<String>) -> Self {
        Self {
            status: Some(status),
            error: Some(error),
            ..Self::default()
        }
    }
}

impl Entity for Model {
    type Id = String;
    type Patch = ModelPatch;

    fn id(&self) -> &String {
        &self.id
    }

    fn apply(&mut self, patch: &ModelPatch) {
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(path) = &patch.path {
            self.path = Some(path.clone());
        }
        if let Some(quantization) = &patch.quantization {
            self.quantization = Some(quantization.clone());
        }
        if let Some(ctx_size) = patch.ctx_size {
            self.ctx_size = Some(ctx_size);
        }
        if let Some(error) = &patch.error {
            self.error.clone_from(error);
        }
    }

    fn version(&self) -> Option<u64> {
        self.version
    }
}

// ── Logs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub timestamp: u64,
}

impl Entity for LogEntry {
    type Id = u64;
    /// Log entries are immutable once produced.
    type Patch = Infallible;

    fn id(&self) -> &u64 {
        &self.id
    }

    fn apply(&mut self, patch: &Infallible) {
        match *patch {}
    }
}

// ── Presets ──────────────────────────────────────────────────────────────────

/// INI sections of a preset: `[section]` → `key = value`.
pub type PresetSections = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    /// File stem; doubles as the preset id.
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub parameters: PresetSections,
    #[serde(default)]
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<PresetSections>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl Entity for Preset {
    type Id = String;
    type Patch = PresetPatch;

    fn id(&self) -> &String {
        &self.name
    }

    fn apply(&mut self, patch: &PresetPatch) {
        if let Some(parameters) = &patch.parameters {
            self.parameters.clone_from(parameters);
        }
        if let Some(raw) = &patch.raw {
            self.raw.clone_from(raw);
        }
    }
}

// ── Router status ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        })
    }
}

/// Snapshot of the inference router process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStatus {
    pub status: RouterState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Names of the models currently loaded by the router.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loaded_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouterStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.status == RouterState::Running
    }
}
