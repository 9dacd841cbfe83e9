//! User preferences that change between questions.
//!
//! Stored apart from [`FocusConfig`](crate::config::FocusConfig) because the
//! front end writes them at runtime; the coordinator re-reads them at every
//! question.

use crate::error::{FocusError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Which speech path a turn uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechBackend {
    /// Per-sentence synthesis by the backend, played through the sink.
    #[default]
    Remote,
    /// Platform speech on this machine.
    OnDevice,
}

impl std::str::FromStr for SpeechBackend {
    type Err = FocusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "server" => Ok(Self::Remote),
            "device" | "on_device" | "on-device" | "local" => Ok(Self::OnDevice),
            other => Err(FocusError::Config(format!("unknown speech backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub speech_backend: SpeechBackend,
    /// Persona sent with each question.
    pub persona: Option<String>,
}

impl Preferences {
    /// `<data dir>/preferences.toml`.
    pub fn default_path() -> PathBuf {
        crate::config::data_dir().join("preferences.toml")
    }

    /// Read preferences; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| FocusError::Config(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`load`](Self::load), but logs and falls back to defaults on error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("ignoring unreadable preferences at {}: {e}", path.display());
            Self::default()
        })
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| FocusError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
