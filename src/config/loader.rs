//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles file discovery,
//! environment detection and layering of TOML files with environment variable
//! overrides through the `config` crate.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info, warn};

use super::error::{ConfigResult, ConfigurationError};
use super::ReprocessorConfig;

/// Prefix of environment variable overrides, e.g. `DLQ_REPROCESSOR__CONSUMER__WORKER_COUNT`
pub const ENV_PREFIX: &str = "DLQ_REPROCESSOR";
pub const ENV_SEPARATOR: &str = "__";
const BASE_FILE_STEM: &str = "reprocessor";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: ReprocessorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load from the default directory for the detected environment
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load from `config_dir` (or the default) for the detected environment
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load from `config_dir` for a named environment, reading overrides from
    /// the process environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::build(config_dir, environment, None)
    }

    /// Load with an explicit set of override variables instead of the process
    /// environment. Keys use the same `DLQ_REPROCESSOR__SECTION__FIELD` form.
    ///
    /// This is useful for testing without modifying global environment variables.
    pub fn load_with_overrides(
        config_dir: Option<PathBuf>,
        environment: &str,
        overrides: HashMap<String, String>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::build(config_dir, environment, Some(overrides))
    }

    fn build(
        config_dir: Option<PathBuf>,
        environment: &str,
        overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment,
            directory = %config_directory.display(),
            "Loading reprocessor configuration"
        );

        let base_path = config_directory.join(format!("{BASE_FILE_STEM}.toml"));
        let env_path = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        if !base_path.exists() {
            warn!(
                path = %base_path.display(),
                "Base configuration file not found, using built-in defaults"
            );
        }

        let mut env_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);
        if let Some(overrides) = overrides {
            env_source = env_source.source(Some(overrides.into_iter().collect()));
        }

        let config: ReprocessorConfig = Config::builder()
            .add_source(Self::toml_source(&base_path)?)
            .add_source(Self::toml_source(&env_path)?)
            .add_source(env_source)
            .build()?
            .try_deserialize()?;

        config.validate()?;

        debug!(
            config = %Self::sanitize_config_for_logging(&config),
            "Resolved reprocessor configuration"
        );

        info!(
            environment = environment,
            subscription = %config.broker.subscription,
            quarantine_backend = %config.quarantine.backend,
            max_attempts = config.scheduler.max_attempts,
            "Reprocessor configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    fn toml_source(path: &Path) -> ConfigResult<File<config::FileSourceFile, FileFormat>> {
        let name = path.to_str().ok_or_else(|| {
            ConfigurationError::file_read_error(path.display().to_string(), "path is not UTF-8")
        })?;
        Ok(File::new(name, FileFormat::Toml).required(false))
    }

    /// Validated configuration
    pub fn config(&self) -> &ReprocessorConfig {
        &self.config
    }

    /// Configuration as JSON with sensitive fields masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    /// Environment name the overlay file was chosen by
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect current environment: DLQ_REPROCESSOR_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        env::var("DLQ_REPROCESSOR_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        env::var("DLQ_REPROCESSOR_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn sanitize_config_for_logging(config: &ReprocessorConfig) -> serde_json::Value {
        let mut value = serde_json::json!(config);
        mask_secrets(&mut value);
        value
    }
}

const SECRET_KEYS: [&str; 5] = ["password", "secret", "token", "credential", "database_url"];

/// Replace values under secret-looking keys, recursing into everything else
fn mask_secrets(value: &mut serde_json::Value) {
    use serde_json::Value;

    match value {
        Value::Object(fields) => {
            for (name, field) in fields.iter_mut() {
                let name = name.to_lowercase();
                if !SECRET_KEYS.iter().any(|secret| name.contains(secret)) {
                    mask_secrets(field);
                    continue;
                }
                if !field.is_null() {
                    *field = Value::String("[MASKED]".to_string());
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}
