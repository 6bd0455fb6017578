//! Configuration file management
//!
//! Loads TOML configuration files and provides tool settings.
//! Default config path: ~/.config/logind-poker/config.toml

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_CALL_TIMEOUT_MS, DEFAULT_TIMESTAMP_FORMAT};

/// Tool settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// D-Bus settings
    pub bus: BusConfig,
    /// TakeControl settings
    pub control: ControlConfig,
    /// Output settings
    pub output: OutputConfig,
    /// Device settings
    pub devices: DevicesConfig,
}

/// D-Bus settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Timeout for each setup call in milliseconds
    pub call_timeout_ms: u64,
}

/// TakeControl settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Pass force=true to TakeControl (steal control from another controller)
    pub force: bool,
}

/// Output settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// chrono format string for event timestamps
    pub timestamp_format: String,
}

/// Device settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Log raw bytes read from active device fds (debug level)
    pub trace_input: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}

impl Config {
    /// System-wide config path
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/logind-poker/config.toml";

    /// Get the path that would be used for loading config
    /// Returns None if using built-in defaults
    pub fn config_path() -> Option<PathBuf> {
        // 1. LOGIND_POKER_CONFIG environment variable
        if let Ok(path) = std::env::var("LOGIND_POKER_CONFIG") {
            let p = Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        // 2. User config: ~/.config/logind-poker/config.toml
        if let Some(config_path) = default_config_path() {
            if config_path.exists() {
                return Some(config_path);
            }
        }

        // 3. System config
        let system_config = Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load configuration with priority:
    /// 1. explicit path (--config), errors are fatal
    /// 2. LOGIND_POKER_CONFIG environment variable
    /// 3. ~/.config/logind-poker/config.toml (user config)
    /// 4. /etc/logind-poker/config.toml (system config)
    /// 5. Built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            info!("Loaded config: {}", path.display());
            return Ok(config);
        }

        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return Ok(config);
                }
                Err(e) => {
                    warn!("Failed to load config {}: {:#}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Ok(Self::default())
    }

    /// Load settings from specified path
    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse settings from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

/// Get default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("logind-poker").join("config.toml"))
}
