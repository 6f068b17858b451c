use std::env;
use std::path::PathBuf;

use config::{ConfigError, Environment, File};

use super::models::Config;

const CONFIG_ENV_VAR: &str = "MASH_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/mash/mash_config.yaml";
const ENV_PREFIX: &str = "MASH";
const ENV_SEPARATOR: &str = "__";

/// Load configuration with priority (highest to lowest):
/// 1. System environment variables (`MASH__*`)
/// 2. Config file (default: `/etc/mash/mash_config.yaml`)
/// 3. Struct defaults
pub fn load() -> Result<Config, ConfigError> {
    // Load .env if present; a missing file is not an error
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config);

    Ok(config)
}

/// Secrets never live in the config file, only in the environment.
fn load_secrets(config: &mut Config) {
    if let Ok(secret) = env::var("MASH_JWT_SECRET") {
        config.jwt_secret = Some(secret);
    }
    if let Ok(pass) = env::var("MASH_AMQP_PASS") {
        config.amqp_pass = Some(pass);
    }
    if let Ok(pass) = env::var("MASH_SMTP_PASS") {
        config.smtp_pass = Some(pass);
    }
}

/// Load from a specific path. Useful for tests with custom config files.
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // MASH__LOG_DIR -> log_dir
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
