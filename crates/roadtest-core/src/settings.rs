//! Persistent configuration for roadtest.
//!
//! Stores user defaults in `~/.roadtest/config.json`. The primary use case is
//! recording the device cloud endpoints once so that remote runs don't need
//! them on every invocation.
//!
//! # Example
//!
//! ```no_run
//! use roadtest_core::settings::Settings;
//!
//! // Load (returns defaults if file doesn't exist)
//! let settings = Settings::load();
//!
//! if let Some(hub) = &settings.hub_url {
//!     println!("Device cloud hub: {}", hub);
//! }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// Returns the roadtest directory path (`~/.roadtest/`).
///
/// Creates the directory if it doesn't exist.
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
pub fn roadtest_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".roadtest");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Returns the logs directory path (`~/.roadtest/logs/`).
///
/// Creates the directory if it doesn't exist.
pub fn logs_dir() -> PathBuf {
    let dir = roadtest_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Persistent roadtest configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Device cloud hub URL used to start remote sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_url: Option<String>,

    /// Device cloud storage URL used to upload built artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,

    /// Default port for the local test event server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
}

impl Settings {
    /// Load settings from `~/.roadtest/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        let path = roadtest_dir().join(CONFIG_FILENAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save settings to `~/.roadtest/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let path = roadtest_dir().join(CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}
