//! Layered configuration: struct defaults, then the shared YAML config
//! file, then `MASH__<KEY>` environment overrides. Secrets (AMQP, SMTP,
//! JWT) come from the environment only.

mod models;
mod sources;

pub use models::Config;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(sources::load()?)
    }

    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        Ok(sources::load_from_sources(path)?)
    }
}
