//! Configuration types for the spoken-response pipeline.

use crate::session::types::SessionMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Backend endpoints and identity.
    pub api: ApiConfig,
    /// Text segmentation and conversation settings.
    pub pipeline: PipelineConfig,
    /// Per-sentence remote synthesis settings.
    pub synthesis: SynthesisConfig,
    /// Playback sink settings.
    pub playback: PlaybackConfig,
    /// Filler clip settings.
    pub filler: FillerConfig,
    /// Turn and audio persistence settings.
    pub persistence: PersistenceConfig,
    /// On-device speech fallback settings.
    pub fallback: FallbackConfig,
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the assistant backend, without a trailing slash.
    pub base_url: String,
    /// User id sent with answer, persistence and session requests.
    pub user_id: String,
    /// Connect timeout for every request in milliseconds.
    pub connect_timeout_ms: u64,
    pub transcribe_path: String,
    pub ask_path: String,
    pub synthesize_path: String,
    pub filler_path: String,
    pub save_message_path: String,
    pub save_audio_path: String,
    pub create_session_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_owned(),
            user_id: "default".to_owned(),
            connect_timeout_ms: 5_000,
            transcribe_path: "/transcribe".to_owned(),
            ask_path: "/ask_stream".to_owned(),
            synthesize_path: "/tts_stream".to_owned(),
            filler_path: "/filler_audio".to_owned(),
            save_message_path: "/save_message".to_owned(),
            save_audio_path: "/save_audio".to_owned(),
            create_session_path: "/sessions".to_owned(),
        }
    }
}

impl ApiConfig {
    /// Join the base URL with an endpoint path.
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Segmentation and conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum characters before a terminal mark may end a sentence.
    ///
    /// Keeps abbreviations ("Dr.") and decimals from firing a synthesis
    /// request on their own.
    pub min_sentence_chars: usize,
    /// Mode recorded on freshly created sessions.
    pub session_mode: SessionMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_sentence_chars: 20,
            session_mode: SessionMode::Question,
        }
    }
}

/// Remote synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Upper bound for one sentence's request plus streaming, in milliseconds.
    pub sentence_timeout_ms: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            sentence_timeout_ms: 15_000,
        }
    }
}

impl SynthesisConfig {
    pub fn sentence_timeout(&self) -> Duration {
        Duration::from_millis(self.sentence_timeout_ms)
    }
}

/// Playback sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Bytes that must be buffered before playback starts.
    pub min_start_bytes: usize,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_start_bytes: 4_096,
            output_device: None,
        }
    }
}

/// Filler clip settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerConfig {
    /// Whether to request a filler clip after each question.
    pub enabled: bool,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// How many waits the audio step allows for the message id.
    pub message_id_attempts: u32,
    /// Length of each wait in milliseconds.
    pub message_id_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            message_id_attempts: 10,
            message_id_interval_ms: 300,
        }
    }
}

impl PersistenceConfig {
    /// Total time the audio step waits for the message id.
    pub fn message_id_wait(&self) -> Duration {
        Duration::from_millis(self.message_id_interval_ms)
            .saturating_mul(self.message_id_attempts.max(1))
    }
}

/// On-device speech settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Synthesis command to use (None = first of `say`, `espeak-ng`, `espeak`).
    pub command: Option<String>,
    /// Voice name passed to the command.
    pub voice: Option<String>,
    /// Speaking rate in words per minute.
    pub rate_wpm: Option<u32>,
}

impl FocusConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::FocusError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::FocusError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/focus-voice/config.toml`.
    pub fn default_config_path() -> PathBuf {
        config_dir().join("config.toml")
    }
}

/// Application config directory.
///
/// Override with the `FOCUS_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("FOCUS_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("focus-voice"))
        .unwrap_or_else(|| PathBuf::from("/tmp/focus-voice-config"))
}

/// Application data directory (preferences).
///
/// Override with the `FOCUS_DATA_DIR` environment variable.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("FOCUS_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("focus-voice"))
        .unwrap_or_else(|| PathBuf::from("/tmp/focus-voice-data"))
}
