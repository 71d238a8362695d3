//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles YAML file discovery,
//! environment detection and layering of `PLUGSQL_*` environment variables
//! over file values.

use super::ClientConfig;
use crate::error::{ClientError, ClientResult};
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_STEM: &str = "plugsql-config";

/// Loaded configuration together with where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: ClientConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ClientResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ClientResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ClientResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = %environment,
            database_host = %config.database.host,
            max_parallel = config.pool.max_parallel,
            connection_mode = ?config.connection_mode,
            "⚙️ CONFIG: Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, validating it first.
    pub fn from_config(config: ClientConfig) -> ClientResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: Self::default_config_directory(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get the current environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Get the configuration directory
    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with sensitive fields masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    /// Detect current environment from environment variables
    fn detect_environment() -> String {
        env::var("PLUGSQL_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        if let Ok(dir) = env::var("PLUGSQL_CONFIG_DIR") {
            return PathBuf::from(dir);
        }

        for dir in [PathBuf::from("config"), PathBuf::from(".")] {
            if dir.join(format!("{CONFIG_FILE_STEM}.yaml")).exists() {
                debug!("Found config directory: {}", dir.display());
                return dir;
            }
        }

        PathBuf::from("config")
    }

    /// Layer the base file, the environment overlay and `PLUGSQL_*` variables.
    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ClientResult<ClientConfig> {
        let base = config_directory.join(CONFIG_FILE_STEM);
        let overlay = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}"));

        let settings = Config::builder()
            .add_source(File::new(&base.to_string_lossy(), FileFormat::Yaml).required(false))
            .add_source(File::new(&overlay.to_string_lossy(), FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix("PLUGSQL")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("search_path.search_path")
                    .with_list_parse_key("search_path.search_path_prefix")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: ClientConfig = settings.try_deserialize()?;

        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.is_empty() {
                debug!("Using DATABASE_URL from environment");
                config.database.url = Some(url);
            }
        }

        Ok(config)
    }

    fn sanitize_config_for_logging(config: &ClientConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        let sensitive_patterns = ["password", "secret", "token", "url"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);
        config_json
    }

    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if is_sensitive {
                        if let serde_json::Value::String(s) = val {
                            *val = if s.is_empty() {
                                serde_json::Value::String("[EMPTY]".to_string())
                            } else {
                                serde_json::Value::String("[MASKED]".to_string())
                            };
                        }
                    } else {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                    }
                }
            }
            serde_json::Value::Array(arr) => {
                for item in arr.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}

impl From<&ConfigManager> for ClientConfig {
    fn from(manager: &ConfigManager) -> Self {
        manager.config.clone()
    }
}

/// Load a single explicit YAML file, without environment layering.
pub fn load_config_file(path: &Path) -> ClientResult<ClientConfig> {
    if !path.exists() {
        return Err(ClientError::ConfigurationError(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }
    let config: ClientConfig = Config::builder()
        .add_source(File::from(path).format(FileFormat::Yaml))
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}
