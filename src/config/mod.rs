//! Application configuration.
//!
//! Loaded from YAML files and environment variables into a single
//! [`Config`].

mod engine;

pub use engine::{
    EngineConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_INVOKE_TIMEOUT_MS, DEFAULT_REFLECTION_TIMEOUT_MS,
};

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "rpcflow.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RPCFLOW_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RPCFLOW";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RPCFLOW_LOG";
/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "RPCFLOW_LOG_FORMAT";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine runtime settings.
    pub engine: EngineConfig,
    /// YAML file of orchestrations, stages and links.
    pub definitions_path: Option<String>,
    /// Orchestrations to start at boot.
    pub run: Vec<String>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `rpcflow.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Definitions file, resolved against `base` when relative.
    pub fn definitions_file(&self, base: &Path) -> Option<PathBuf> {
        self.definitions_path.as_ref().map(|p| {
            let path = Path::new(p);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

/// Get the base directory for resolving file references in configs.
///
/// Returns the parent directory of `path` (or of CONFIG_ENV_VAR if set),
/// otherwise the current directory.
pub fn config_base_dir(path: Option<&str>) -> PathBuf {
    let config_path = path
        .map(str::to_string)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok());
    config_path
        .as_deref()
        .and_then(|p| Path::new(p).parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
