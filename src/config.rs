//! Persistent application configuration
//!
//! Stores input recordings, history location, server address and IR
//! parameters in a JSON file at `<data_dir>/roomtester/config.json`.
//! Command line flags override individual fields.

use roomtester_core::stats::history::DEFAULT_SNAPSHOT_EVERY;
use roomtester_core::IrConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_reference_path() -> PathBuf {
    PathBuf::from("ref.wav")
}

fn default_room_path() -> PathBuf {
    PathBuf::from("room.wav")
}

fn default_history_path() -> PathBuf {
    PathBuf::from("meter_history.json")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_port() -> u16 {
    5000
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_snapshot_every() -> u64 {
    DEFAULT_SNAPSHOT_EVERY
}

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Reference recording
    #[serde(default = "default_reference_path")]
    pub reference_path: PathBuf,
    /// Room re-recording of the reference
    #[serde(default = "default_room_path")]
    pub room_path: PathBuf,
    /// Meter history snapshot file
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
    /// Directory receiving `session.log`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Deconvolution parameters
    #[serde(default)]
    pub ir: IrConfig,
    /// History writes between snapshots
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            reference_path: default_reference_path(),
            room_path: default_room_path(),
            history_path: default_history_path(),
            log_dir: default_log_dir(),
            port: default_port(),
            bind_addr: default_bind_addr(),
            ir: IrConfig::default(),
            snapshot_every: default_snapshot_every(),
        }
    }
}

/// Where the configuration came from, reported once logging is up
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Invalid { path: PathBuf, error: String },
}

impl AppConfig {
    /// Config file path: `<data_dir>/roomtester/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roomtester")
            .join("config.json")
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> (Self, ConfigSource) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => (config, ConfigSource::File(path.to_path_buf())),
                Err(e) => (
                    Self::default(),
                    ConfigSource::Invalid {
                        path: path.to_path_buf(),
                        error: e.to_string(),
                    },
                ),
            },
            Err(_) => (Self::default(), ConfigSource::Missing(path.to_path_buf())),
        }
    }
}

impl ConfigSource {
    /// Log how the config was obtained
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => {
                tracing::info!(path = %path.display(), "Loaded config from disk")
            }
            ConfigSource::Missing(path) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults")
            }
            ConfigSource::Invalid { path, error } => {
                tracing::warn!(path = %path.display(), error = %error, "Failed to parse config, using defaults")
            }
        }
    }
}
