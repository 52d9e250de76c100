//! Configuration for the llamadash gateway and client.
//!
//! Every field has a default, so an absent or partial file is valid.

pub mod loader;
pub mod schema;

pub use {
    loader::{CONFIG_ENV, discover, discover_and_load, load},
    schema::{ClientConfig, DashboardConfig, LogsConfig, ReconnectConfig, ServerConfig},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
