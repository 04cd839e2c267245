//! # Configuration Management Module
//!
//! Persistent settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `recordings_dir`: base directory session directories are created in
//! - `write_queue_capacity`: lines that may wait for the file writer
//! - `scan_seconds` / `scan_name_filter`: device discovery window and name match
//! - `keep_alive`: indicator shown while streaming in the background
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/ura-stream/config.toml
//! - Linux: ~/.config/ura-stream/config.toml
//! - Windows: %APPDATA%\ura-stream\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "ura-stream";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    pub title: String,
    pub text: String,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            title: "URA Stream".to_string(),
            text: "URA Stream is streaming sensor data in the background.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recordings_dir: PathBuf,
    pub write_queue_capacity: usize,
    pub scan_seconds: u64,
    pub scan_name_filter: String,
    pub keep_alive: KeepAliveConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recordings_dir: Self::default_recordings_dir(),
            write_queue_capacity: 65_536,
            scan_seconds: 5,
            scan_name_filter: "polar".to_string(),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

impl Config {
    fn default_recordings_dir() -> PathBuf {
        dirs::document_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("recordings"))
    }

    /// Get the path to the config file
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load config from the default location, or create it with defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, or create it with defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.write_queue_capacity, 65_536);
        assert_eq!(config.scan_seconds, 5);
        assert_eq!(config.scan_name_filter, "polar");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            recordings_dir = "/data/sessions"
            scan_seconds = 10
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.recordings_dir, PathBuf::from("/data/sessions"));
        assert_eq!(config.scan_seconds, 10);
        assert_eq!(config.write_queue_capacity, 65_536);
        assert_eq!(config.keep_alive, KeepAliveConfig::default());
    }

    #[test]
    fn test_load_creates_default_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_from(&path).expect("Failed to reload config");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_invalid_file_reports_parse_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "scan_seconds = \"soon\"").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseFailed(_))
        ));
    }
}
