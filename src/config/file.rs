//! TOML configuration file loading
//!
//! Supports `~/.config/apx/config.toml` as a persistent config source.
//! All fields are optional, the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct AssistantConfigFile {
    /// Inference backend configuration
    #[serde(default)]
    pub backend: BackendFileConfig,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// API keys for speech services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Conversation storage configuration
    #[serde(default)]
    pub persistence: PersistenceFileConfig,

    /// Session controller tuning
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Inference backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    /// Base URL of the chat backend (e.g. `https://apx-ai-backend.onrender.com`)
    pub url: Option<String>,

    /// Upper bound for one turn round-trip, in seconds
    pub timeout_secs: Option<u64>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Enable microphone capture and spoken replies
    pub enabled: Option<bool>,

    /// Recognition language tag (e.g. "en-US")
    pub language: Option<String>,

    /// STT provider ("whisper" or "deepgram")
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// TTS provider ("openai" or "elevenlabs")
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub tts_voice: Option<String>,

    /// Speech rate multiplier
    pub speed: Option<f64>,

    /// Output gain (0.0 to 1.0)
    pub volume: Option<f32>,

    /// Longest utterance captured per activation, in seconds
    pub max_utterance_secs: Option<u64>,

    /// How long to wait for speech to begin, in seconds
    pub listen_timeout_secs: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Conversation storage configuration
#[derive(Debug, Default, Deserialize)]
pub struct PersistenceFileConfig {
    /// Store completed turns in the local database
    pub enabled: Option<bool>,

    /// Override for the data directory
    pub data_dir: Option<String>,
}

/// Session controller configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// How long a cancelled operation may take to release its device, in milliseconds
    pub cancel_grace_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `AssistantConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> AssistantConfigFile {
    let Some(path) = config_file_path() else {
        return AssistantConfigFile::default();
    };

    if !path.exists() {
        return AssistantConfigFile::default();
    }

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
///
/// Parse failures are logged and fall back to defaults.
pub fn load_config_file_from(path: &Path) -> AssistantConfigFile {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                AssistantConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            AssistantConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/apx/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("apx").join("config.toml"))
}
