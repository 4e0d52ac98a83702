//! Configuration for tracelens
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Conversion into typed analyzer options

use crate::analyzer::AnalyzerOptions;
use crate::rank::MutationMode;
use crate::vendor::ApmType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracelensConfig {
    pub log: LogSettings,

    /// Root-cause analysis settings
    pub analyzer: AnalyzerSettings,

    /// APM adapter service
    pub adapter: AdapterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Minimum share (percent) of the entry duration a root cause must account for
    pub mutated_ratio: u32,

    /// single, maxService or top3Service
    pub mutate_node_mode: String,

    /// Vendors whose selected node is refetched with detail spans
    pub detail_types: Vec<String>,

    /// Treat spans with exceptions as errors
    pub exception_as_error: bool,

    pub cluster_id: String,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            mutated_ratio: 10,
            mutate_node_mode: MutationMode::default().as_str().to_string(),
            detail_types: Vec::new(),
            exception_as_error: false,
            cluster_id: String::new(),
        }
    }
}

impl AnalyzerSettings {
    pub fn to_options(&self) -> ConfigResult<AnalyzerOptions> {
        let mode = self
            .mutate_node_mode
            .parse::<MutationMode>()
            .map_err(ConfigError::ValidationError)?;
        let detail_types = self
            .detail_types
            .iter()
            .map(|name| {
                name.parse::<ApmType>()
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(AnalyzerOptions {
            mutated_ratio: self.mutated_ratio,
            mode,
            detail_types,
            exception_as_error: self.exception_as_error,
            cluster_id: self.cluster_id.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    /// host:port or full URL of the adapter service
    pub address: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            timeout_secs: 10,
        }
    }
}

impl AdapterSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. TRACELENS_CONFIG environment variable
    /// 3. ~/.config/tracelens/config.toml
    /// 4. /etc/tracelens/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<TracelensConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                TracelensConfig::default()
            }
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("TRACELENS_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("TRACELENS_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/tracelens/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn load_from_file(&self, path: &Path) -> ConfigResult<TracelensConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: TracelensConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut TracelensConfig) {
        if let Ok(val) = std::env::var("TRACELENS_LOG_LEVEL") {
            config.log.level = val;
        }

        if let Ok(val) = std::env::var("TRACELENS_ADAPTER_ADDRESS") {
            config.adapter.address = val;
        }
        if let Ok(val) = std::env::var("TRACELENS_ADAPTER_TIMEOUT") {
            config.adapter.timeout_secs = val.parse().unwrap_or(config.adapter.timeout_secs);
        }

        if let Ok(val) = std::env::var("TRACELENS_MUTATED_RATIO") {
            config.analyzer.mutated_ratio = val.parse().unwrap_or(config.analyzer.mutated_ratio);
        }
        if let Ok(val) = std::env::var("TRACELENS_MUTATE_NODE_MODE") {
            config.analyzer.mutate_node_mode = val;
        }
        if let Ok(val) = std::env::var("TRACELENS_DETAIL_TYPES") {
            config.analyzer.detail_types = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = std::env::var("EXCEPTION_AS_ERROR") {
            config.analyzer.exception_as_error = val.eq_ignore_ascii_case("true");
        }
    }

    fn validate(&self, config: &TracelensConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.log.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.log.level, valid_levels
            )));
        }

        if config.analyzer.mutated_ratio > 100 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid mutated ratio: {}. Must be between 0 and 100",
                config.analyzer.mutated_ratio
            )));
        }

        // Mode and vendor names
        config.analyzer.to_options()?;

        if config.adapter.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Adapter address cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tracelens").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// User config directory lookup
mod dirs {
    use std::ffi::OsString;
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        resolve(std::env::var_os("XDG_CONFIG_HOME"), std::env::var_os("HOME"))
    }

    /// `$XDG_CONFIG_HOME`, else `$HOME/.config`
    pub(super) fn resolve(xdg: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
        xdg.filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| home.map(|h| PathBuf::from(h).join(".config")))
    }
}
