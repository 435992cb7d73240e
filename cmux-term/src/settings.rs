//! Terminal settings
//!
//! Stored as JSON in `<config dir>/cmux/settings.json`. Missing fields take
//! their defaults so older files keep loading.

use std::path::{Path, PathBuf};

use anyhow::Context;
use cmux::MuxConfig;
use serde::{Deserialize, Serialize};

/// Terminal settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Serial port path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Channels to establish after the multiplexer starts
    pub dlcis: Vec<u8>,
    /// Appended to every line read from stdin
    pub line_ending: String,
    /// Engine configuration
    pub mux: MuxConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            dlcis: vec![1],
            line_ending: "\r".to_string(),
            mux: MuxConfig::default(),
        }
    }
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cmux").join("settings.json"))
    }

    /// Load settings from the default location, falling back to defaults
    pub fn load() -> Self {
        Self::default_path()
            .filter(|path| path.exists())
            .and_then(|path| match Self::load_from(&path) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    tracing::warn!("Ignoring settings file: {:#}", e);
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Load settings from `path`
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Write settings to `path`, creating its directory
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}
