//! Configuration management module.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::zk::{DEFAULT_PORT, ZkOptions};

/// Configuration load result.
#[derive(Debug)]
pub enum ConfigLoadResult {
    /// Config loaded successfully.
    Loaded(AppConfig),
    /// Config file missing (run on store-registered devices and defaults).
    Missing,
    /// Config file exists but invalid.
    Invalid(ConfigError),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Devices to supervise. Merged into the store's device table at
    /// startup; an empty list falls back to devices already registered
    /// there.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Embedded database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    // packaged installs override this in config.toml
    directories::ProjectDirs::from("", "", "zk-collector")
        .map(|dirs| dirs.data_dir().join("att.db"))
        .unwrap_or_else(|| PathBuf::from("data/att.db"))
}

/// Capture and upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Rows pulled per upload cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Soft receive timeout during live capture, seconds.
    #[serde(default = "default_soft_timeout_secs")]
    pub soft_timeout_secs: u64,
}

fn default_batch_size() -> u64 {
    100
}

fn default_soft_timeout_secs() -> u64 {
    2
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the daily-rolling log file.
    #[serde(default = "default_log_dir")]
    pub directory: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// One ZKTeco terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// IPv4/IPv6 literal.
    pub ip: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
    /// Stable device key; unique across the site.
    pub serial_number: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub force_udp: bool,
    /// Numeric comm password; 0 when the device has none.
    #[serde(default)]
    pub password: u32,
    /// Probe TCP reachability before each connect.
    #[serde(default)]
    pub precheck: bool,
    #[serde(default = "default_true")]
    pub sync_time_on_connect: bool,
    /// Refresh the store's user cache after each connect.
    #[serde(default)]
    pub cache_users: bool,
}

fn default_device_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            soft_timeout_secs: default_soft_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: default_log_dir(),
        }
    }
}

impl DeviceConfig {
    /// Session options for this device.
    pub fn zk_options(&self) -> ZkOptions {
        ZkOptions {
            ip: self.ip.clone(),
            port: self.port,
            password: self.password,
            timeout: Duration::from_secs(self.connect_timeout_secs),
            force_udp: self.force_udp,
            precheck: self.precheck,
        }
    }

    /// Operator-facing label: display name, else serial.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.serial_number)
    }

    /// Device entry reconstructed from a store row; connection knobs fall
    /// back to their defaults.
    pub fn from_store(ip: String, port: u16, serial_number: String, display_name: Option<String>) -> Self {
        Self {
            ip,
            port,
            serial_number,
            display_name,
            connect_timeout_secs: default_connect_timeout_secs(),
            force_udp: false,
            password: 0,
            precheck: false,
            sync_time_on_connect: true,
            cache_users: false,
        }
    }
}

impl AppConfig {
    /// Get config file path (same directory as executable).
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Attempt to load config with detailed result.
    pub fn try_load(path: &Path) -> ConfigLoadResult {
        if !path.exists() {
            return ConfigLoadResult::Missing;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<AppConfig>(&content) {
                Ok(config) => match config.validate() {
                    Ok(()) => ConfigLoadResult::Loaded(config),
                    Err(e) => ConfigLoadResult::Invalid(e),
                },
                Err(e) => ConfigLoadResult::Invalid(ConfigError::Parse(e)),
            },
            Err(e) => ConfigLoadResult::Invalid(ConfigError::Read(e)),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Validation(
                "Sync batch size must be at least 1".to_string(),
            ));
        }
        if self.sync.soft_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Soft timeout must be at least 1 second".to_string(),
            ));
        }

        let mut serials = std::collections::HashSet::new();
        for device in &self.devices {
            if device.ip.parse::<std::net::IpAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "Device address '{}' is not an IP literal",
                    device.ip
                )));
            }
            if device.port == 0 {
                return Err(ConfigError::Validation(format!(
                    "Device {} port must be greater than 0",
                    device.serial_number
                )));
            }
            if device.serial_number.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Device serial number cannot be empty".to_string(),
                ));
            }
            if !serials.insert(device.serial_number.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device serial number '{}'",
                    device.serial_number
                )));
            }
            if device.connect_timeout_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "Device {} connect timeout must be at least 1 second",
                    device.serial_number
                )));
            }
        }
        Ok(())
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
