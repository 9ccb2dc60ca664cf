// src/config/loader.rs
//! Layered configuration loader: defaults, TOML files, environment overrides

use crate::config::{constants::paths, CoreConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Loads [`CoreConfig`] from an ordered list of TOML files
pub struct ConfigLoader {
    config_paths: Vec<PathBuf>,
    env_prefix: String,
    current_config: CoreConfig,
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// A file that was asked for explicitly is missing
    FileNotFound(String),
    /// TOML syntax or type error
    ParseError(String),
    /// Values parsed but are inconsistent
    ValidationError(Vec<String>),
    /// Filesystem error
    IoError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Configuration file not found: {}", path),
            ConfigError::ParseError(msg) => write!(f, "Configuration parse error: {}", msg),
            ConfigError::ValidationError(errors) => {
                write!(f, "Configuration validation errors: ")?;
                for error in errors {
                    write!(f, "\n  {}", error)?;
                }
                Ok(())
            }
            ConfigError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl ConfigLoader {
    /// Loader over the standard search paths
    pub fn new() -> Self {
        Self::with_paths(Self::discover_config_paths())
    }

    /// Loader over explicit paths, later files win
    pub fn with_paths(config_paths: Vec<PathBuf>) -> Self {
        Self {
            config_paths,
            env_prefix: paths::ENV_PREFIX.to_string(),
            current_config: CoreConfig::default(),
        }
    }

    /// Use a different environment variable prefix
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = prefix.to_string();
        self
    }

    /// Load, merge and validate
    pub fn load(&mut self) -> Result<CoreConfig, ConfigError> {
        let config = self.load_and_merge_configs()?;
        self.current_config = config.clone();
        Ok(config)
    }

    /// Last successfully loaded configuration
    pub fn current(&self) -> &CoreConfig {
        &self.current_config
    }

    /// Parse and validate a single file without merging
    pub fn validate_config_file<P: AsRef<Path>>(&self, path: P) -> Result<CoreConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = toml::from_str(&content)?;
        config
            .validate_consistency()
            .map_err(ConfigError::ValidationError)?;
        Ok(config)
    }

    /// Export current configuration to file
    pub fn export_config<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let toml_content = toml::to_string_pretty(&self.current_config)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    fn load_and_merge_configs(&self) -> Result<CoreConfig, ConfigError> {
        let mut merged_config = toml::Value::try_from(&CoreConfig::default())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        for config_path in &self.config_paths {
            match self.load_config_file(config_path) {
                Ok(file_config) => {
                    debug!(path = %config_path.display(), "merging configuration file");
                    merge_toml_values(&mut merged_config, file_config);
                }
                Err(ConfigError::FileNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        self.apply_environment_overrides(&mut merged_config, std::env::vars());

        let config: CoreConfig = merged_config
            .try_into()
            .map_err(|e| ConfigError::ParseError(format!("Failed to deserialize config: {}", e)))?;
        config
            .validate_consistency()
            .map_err(ConfigError::ValidationError)?;
        Ok(config)
    }

    fn load_config_file<P: AsRef<Path>>(&self, path: P) -> Result<toml::Value, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    // DIGITISER_TRANSFER_NOTIFY_PAGES=4 sets transfer.notify_pages
    fn apply_environment_overrides(
        &self,
        config: &mut toml::Value,
        vars: impl Iterator<Item = (String, String)>,
    ) {
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(&self.env_prefix) else {
                continue;
            };
            let Some((section, field)) = rest.to_lowercase().split_once('_').map(|(s, f)| (s.to_string(), f.to_string())) else {
                warn!(variable = %key, "ignoring override without a field name");
                continue;
            };
            let Some(toml::Value::Table(table)) = config.get_mut(&section) else {
                warn!(variable = %key, "ignoring override for unknown section");
                continue;
            };
            debug!(%section, %field, "environment override");
            table.insert(field, parse_env_value(&value));
        }
    }

    fn discover_config_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from(paths::SYSTEM_CONFIG_PATH),
            PathBuf::from(paths::DEFAULT_CONFIG_FILE),
            PathBuf::from(paths::LOCAL_CONFIG_FILE),
        ]
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_toml_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                if let Some(base_value) = base_table.get_mut(&key) {
                    merge_toml_values(base_value, value);
                } else {
                    base_table.insert(key, value);
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value;
        }
    }
}

fn parse_env_value(value: &str) -> toml::Value {
    if let Ok(int_val) = value.parse::<i64>() {
        toml::Value::Integer(int_val)
    } else if let Ok(float_val) = value.parse::<f64>() {
        toml::Value::Float(float_val)
    } else if let Ok(bool_val) = value.parse::<bool>() {
        toml::Value::Boolean(bool_val)
    } else {
        toml::Value::String(value.to_string())
    }
}
