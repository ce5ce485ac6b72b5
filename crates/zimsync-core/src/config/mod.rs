//! Configuration management for ZimSync.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/zimsync/config.toml` |
//! | macOS | `~/Library/Application Support/ZimSync/config.toml` |
//! | Windows | `%APPDATA%\ZimSync\config.toml` |

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration for ZimSync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display name on the network
    pub device_name: String,
    /// Server port (UDP)
    pub port: u16,
    /// Directory whose immediate files are shared
    pub shared_dir: PathBuf,
    /// Where received files are written; the shared directory when unset
    pub inbound_dir: Option<PathBuf>,
    /// Chunk size for transfers
    pub chunk_size: u32,
    /// Connect readiness bound in seconds
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "ZimSync Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            port: crate::DEFAULT_PORT,
            shared_dir: directories::UserDirs::new()
                .and_then(|dirs| dirs.audio_dir().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(".")),
            inbound_dir: None,
            chunk_size: crate::transfer::DEFAULT_CHUNK_SIZE,
            connect_timeout_secs: crate::DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Path of the configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the platform config directory cannot
    /// be determined.
    pub fn path() -> Result<PathBuf> {
        directories::ProjectDirs::from("", "", "zimsync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or_else(|| Error::Config("cannot determine config directory".to_string()))
    }

    /// Load the configuration file, or defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Write the configuration file, creating its directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on serialization failure or an I/O error.
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}
