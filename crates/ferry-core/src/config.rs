//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use crate::wire::DEFAULT_MAX_FRAME_LENGTH;

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Default idle interval before a connection is considered dead.
pub const DEFAULT_IDLE_SECS: u64 = 3;

/// Default bound on unread inbound messages held per connection.
pub const DEFAULT_INBOUND_QUEUE: usize = 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory all request paths are resolved under.
    pub root_path: PathBuf,
    /// Listen address.
    pub bind_addr: IpAddr,
    /// TCP listen port. 0 = OS-assigned.
    pub port: u16,
    /// Seconds without reads or writes before the connection is closed.
    pub idle_detection_secs: u64,
    /// Chunk size used when serving downloads.
    pub chunk_size: u64,
    /// Pool sizes. 0 = platform default.
    pub accept_threads: usize,
    pub network_io_threads: usize,
    pub file_io_threads: usize,
    pub max_frame_length: u32,
    /// Unread inbound messages held per connection; further ones are dropped.
    pub inbound_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory local paths are resolved under.
    pub root_path: PathBuf,
    pub idle_detection_secs: u64,
    /// Chunk size used when uploading.
    pub chunk_size: u64,
    pub network_io_threads: usize,
    pub file_io_threads: usize,
    /// Upper bound on waiting for a response. 0 = rely on idle detection.
    pub request_timeout_secs: u64,
    pub max_frame_length: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_path: data_dir().join("server"),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9000,
            idle_detection_secs: DEFAULT_IDLE_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            accept_threads: 1,
            network_io_threads: 0,
            file_io_threads: 0,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            root_path: data_dir().join("client"),
            idle_detection_secs: DEFAULT_IDLE_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            network_io_threads: 0,
            file_io_threads: 0,
            request_timeout_secs: 0,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("failed to create root {0}: {1}")]
    RootFailed(PathBuf, std::io::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(FerryConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        write_default_at(&path)?;
        Ok(path)
    }

    /// Create both root directories.
    pub fn ensure_roots(&self) -> Result<(), ConfigError> {
        for root in [&self.server.root_path, &self.client.root_path] {
            std::fs::create_dir_all(root).map_err(|e| ConfigError::RootFailed(root.clone(), e))?;
        }
        Ok(())
    }

    /// Apply FERRY_* overrides, reading variables through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FERRY_SERVER__ROOT") {
            self.server.root_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FERRY_CLIENT__ROOT") {
            self.client.root_path = PathBuf::from(v);
        }
        if let Some(a) = lookup("FERRY_SERVER__BIND").and_then(|v| v.parse().ok()) {
            self.server.bind_addr = a;
        }
        if let Some(p) = lookup("FERRY_SERVER__PORT").and_then(|v| v.parse().ok()) {
            self.server.port = p;
        }
        if let Some(n) = lookup("FERRY_SERVER__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.server.chunk_size = n;
        }
        if let Some(n) = lookup("FERRY_CLIENT__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.client.chunk_size = n;
        }
        if let Some(n) = lookup("FERRY_SERVER__IDLE_SECS").and_then(|v| v.parse().ok()) {
            self.server.idle_detection_secs = n;
        }
        if let Some(n) = lookup("FERRY_CLIENT__IDLE_SECS").and_then(|v| v.parse().ok()) {
            self.client.idle_detection_secs = n;
        }
    }
}

fn write_default_at(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
    }
    let text =
        toml::to_string_pretty(&FerryConfig::default()).map_err(ConfigError::SerializeFailed)?;
    std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
}
