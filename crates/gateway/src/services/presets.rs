use std::{collections::BTreeMap, sync::Mutex};

use llamadash_protocol::{Preset, entity::PresetSections, methods::PresetDeleted};

use crate::{
    error::{MethodError, MethodResult},
    services::lock,
};

const VERSION_LINE: &str = "LLAMA_CONFIG_VERSION = 1";

/// Parse `[section]` / `key = value` text. Blank lines, `;` comments and
/// keys outside any section are skipped.
pub fn parse_ini(content: &str) -> PresetSections {
    let mut sections = PresetSections::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.insert(name.to_string(), BTreeMap::new());
            current = Some(name.to_string());
            continue;
        }
        if let (Some(section), Some((key, value))) = (&current, line.split_once('='))
            && let Some(entries) = sections.get_mut(section)
        {
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    sections
}

/// Render sections as INI, leaving out empty values.
///
/// A leading `_` marks a key to be written verbatim, so `_nCtx` renders as
/// `nCtx`. A lone `_` is kept as is.
pub fn render_ini(sections: &PresetSections) -> String {
    let mut out = format!("{VERSION_LINE}\n\n");
    for (section, entries) in sections {
        out.push_str(&format!("[{section}]\n"));
        for (key, value) in entries.iter().filter(|(_, v)| !v.is_empty()) {
            let key = key.strip_prefix('_').filter(|k| !k.is_empty()).unwrap_or(key);
            out.push_str(&format!("{key} = {value}\n"));
        }
        out.push('\n');
    }
    out
}

/// Preset files kept in memory, keyed by name.
#[derive(Default)]
pub struct PresetStore {
    files: Mutex<BTreeMap<String, String>>,
}

fn validate_name(name: &str) -> MethodResult<()> {
    let bad = name.trim().is_empty()
        || name.contains(['/', '\\'])
        || name.contains("..");
    if bad {
        return Err(MethodError::InvalidParams(format!(
            "invalid preset name: {name:?}"
        )));
    }
    Ok(())
}

fn to_preset(name: &str, raw: &str) -> Preset {
    Preset {
        name: name.to_string(),
        path: format!("presets/{name}.ini"),
        file: format!("{name}.ini"),
        parameters: parse_ini(raw),
        raw: raw.to_string(),
    }
}

impl PresetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Preset> {
        lock(&self.files)
            .iter()
            .map(|(name, raw)| to_preset(name, raw))
            .collect()
    }

    pub fn read(&self, name: &str) -> MethodResult<Preset> {
        lock(&self.files)
            .get(name)
            .map(|raw| to_preset(name, raw))
            .ok_or_else(|| MethodError::not_found("Preset", name))
    }

    /// Write `config`, replacing any existing preset of that name.
    pub fn save(&self, name: &str, config: &PresetSections) -> MethodResult<Preset> {
        validate_name(name)?;
        let raw = render_ini(config);
        let preset = to_preset(name, &raw);
        lock(&self.files).insert(name.to_string(), raw);
        Ok(preset)
    }

    /// Create an empty preset with a global `[*]` section.
    pub fn create(&self, name: &str, description: Option<&str>) -> MethodResult<Preset> {
        validate_name(name)?;
        let mut files = lock(&self.files);
        if files.contains_key(name) {
            return Err(MethodError::InvalidParams(format!(
                "Preset already exists: {name}"
            )));
        }
        let mut raw = String::new();
        if let Some(description) = description {
            raw.push_str(&format!("; {description}\n"));
        }
        raw.push_str(&render_ini(&PresetSections::from([(
            "*".to_string(),
            BTreeMap::new(),
        )])));
        let preset = to_preset(name, &raw);
        files.insert(name.to_string(), raw);
        Ok(preset)
    }

    pub fn delete(&self, name: &str) -> MethodResult<PresetDeleted> {
        lock(&self.files)
            .remove(name)
            .map(|_| PresetDeleted {
                filename: name.to_string(),
                deleted: true,
            })
            .ok_or_else(|| MethodError::not_found("Preset", name))
    }

    /// Store raw INI text as-is.
    pub fn insert_raw(&self, name: &str, raw: impl Into<String>) -> MethodResult<Preset> {
        validate_name(name)?;
        let raw = raw.into();
        let preset = to_preset(name, &raw);
        lock(&self.files).insert(name.to_string(), raw);
        Ok(preset)
    }
}
