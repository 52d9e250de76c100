use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{ConfigError, DashboardConfig, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "LLAMADASH_CONFIG";

const CONFIG_STEM: &str = "llamadash";
const EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json"];

/// Load the config from `$LLAMADASH_CONFIG`, `./llamadash.{toml,yaml,yml,json}`
/// or the platform config directory, in that order.
///
/// Never fails: a missing file yields defaults, and a file that does not
/// parse is logged and replaced by defaults.
pub fn discover_and_load() -> DashboardConfig {
    let Some(path) = discover() else {
        debug!("no config file found, using defaults");
        return DashboardConfig::default();
    };
    match load(&path) {
        Ok(config) => {
            debug!(path = %path.display(), "loaded config");
            config
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            DashboardConfig::default()
        },
    }
}

/// First config file that exists, if any.
pub fn discover() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
        return Some(path);
    }
    if let Some(path) = find_in(Path::new(".")) {
        return Some(path);
    }
    directories::ProjectDirs::from("", "", CONFIG_STEM).and_then(|d| find_in(d.config_dir()))
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{CONFIG_STEM}.{ext}")))
        .find(|p| p.is_file())
}

/// Load a config file, picking the format from its extension.
pub fn load(path: &Path) -> Result<DashboardConfig> {
    let raw = std::fs::read_to_string(path)?;
    parse(&raw, path)
}

fn parse(raw: &str, path: &Path) -> Result<DashboardConfig> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "llamadash.toml", "[server]\nport = 9000\n");
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
    }

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "llamadash.yml",
            "client:\n  url: ws://10.0.0.2:8585/llamaproxws\nlogs:\n  capacity: 20\n",
        );
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.client.url, "ws://10.0.0.2:8585/llamaproxws");
        assert_eq!(cfg.logs.capacity, 20);
    }

    #[test]
    fn loads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "llamadash.json",
            r#"{"client": {"reconnect": {"attempts": 0}}}"#,
        );
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.client.reconnect.attempts, 0);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "llamadash.ini", "port=1");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "llamadash.toml", "[server\nport = ");
        assert!(matches!(load(&path).unwrap_err(), ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn find_in_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "llamadash.json", "{}");
        write(dir.path(), "llamadash.toml", "");
        let found = find_in(dir.path()).unwrap();
        assert_eq!(found.extension().unwrap(), "toml");
    }
}
