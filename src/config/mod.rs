//! Configuration management for the APX assistant
//!
//! Values resolve with priority env > TOML file > default.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::voice::{SttProvider, TtsProvider};
use crate::{Error, Result};

use file::AssistantConfigFile;

/// Default chat backend
pub const DEFAULT_BACKEND_URL: &str = "https://apx-ai-backend.onrender.com";

/// Default bound on one turn round-trip
const DEFAULT_TURN_TIMEOUT_SECS: u64 = 30;

/// Default grace period for a cancelled operation to release its device
const DEFAULT_CANCEL_GRACE_MS: u64 = 2000;

/// Assistant configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Inference backend
    pub backend: BackendConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// API keys for speech services
    pub api_keys: ApiKeys,

    /// Path to data directory (database, identity)
    pub data_dir: PathBuf,

    /// Store completed turns in the local database
    pub persistence_enabled: bool,

    /// How long a cancelled operation may take to release its device before it is aborted
    pub cancel_grace: Duration,
}

/// Inference backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL; turns are posted to `{url}/api/chat`
    pub url: String,

    /// Upper bound on one turn round-trip; expiry counts as a transport failure
    pub timeout: Duration,
}

/// Voice processing configuration
///
/// Speed, pitch and volume are fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Enable microphone capture and spoken replies
    pub enabled: bool,

    /// Recognition language tag (e.g. "en-US")
    pub language: String,

    /// STT backend
    pub stt_provider: SttProvider,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// TTS backend
    pub tts_provider: TtsProvider,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// Speech rate multiplier (0.25 to 4.0)
    pub speed: f64,

    /// Voice pitch multiplier. Not configurable; the hosted TTS providers
    /// expose no pitch control, so it is carried but not applied.
    pub pitch: f32,

    /// Output gain (0.0 to 1.0)
    pub volume: f32,

    /// Longest utterance captured per activation
    pub max_utterance: Duration,

    /// How long capture waits for speech to begin
    pub listen_timeout: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            language: "en-US".to_string(),
            stt_provider: SttProvider::Whisper,
            stt_model: "whisper-1".to_string(),
            tts_provider: TtsProvider::OpenAI,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            speed: 1.6,
            pitch: 0.8,
            volume: 1.0,
            max_utterance: Duration::from_secs(15),
            listen_timeout: Duration::from_secs(8),
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper and TTS)
    pub openai: Option<String>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<String>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<String>,
}

/// Default data directory: `~/.local/share/apx` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(|| PathBuf::from(".apx"), |d| d.data_dir().join("apx"))
}

impl Config {
    /// Load configuration from the config file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load(disable_voice: bool) -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::from_sources(fc, |key| std::env::var(key).ok(), disable_voice)?;

        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                path = %config.data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        if disable_voice {
            tracing::info!("voice explicitly disabled via --text-only");
        }

        Ok(config)
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn from_sources<F>(fc: AssistantConfigFile, env: F, disable_voice: bool) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_url = env("APX_BACKEND_URL")
            .or(fc.backend.url)
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        url::Url::parse(&backend_url)
            .map_err(|e| Error::Config(format!("invalid backend url {backend_url}: {e}")))?;

        let timeout_secs = parse_env(&env, "APX_TURN_TIMEOUT_SECS")?
            .or(fc.backend.timeout_secs)
            .unwrap_or(DEFAULT_TURN_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(Error::Config("turn timeout must be positive".to_string()));
        }

        let backend = BackendConfig {
            url: backend_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_secs),
        };

        let defaults = VoiceConfig::default();
        let enabled = !disable_voice
            && parse_env(&env, "APX_VOICE_ENABLED")?
                .or(fc.voice.enabled)
                .unwrap_or(defaults.enabled);

        let stt_provider = match env("APX_STT_PROVIDER").or(fc.voice.stt_provider) {
            Some(name) => name.parse()?,
            None => defaults.stt_provider,
        };
        let tts_provider = match env("APX_TTS_PROVIDER").or(fc.voice.tts_provider) {
            Some(name) => name.parse()?,
            None => defaults.tts_provider,
        };

        let speed = parse_env(&env, "APX_TTS_SPEED")?
            .or(fc.voice.speed)
            .unwrap_or(defaults.speed);
        if !(0.25..=4.0).contains(&speed) {
            return Err(Error::Config(format!("speed {speed} outside 0.25..=4.0")));
        }

        let volume = parse_env(&env, "APX_TTS_VOLUME")?
            .or(fc.voice.volume)
            .unwrap_or(defaults.volume);
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::Config(format!("volume {volume} outside 0.0..=1.0")));
        }

        let max_utterance = parse_env(&env, "APX_MAX_UTTERANCE_SECS")?
            .or(fc.voice.max_utterance_secs)
            .map_or(defaults.max_utterance, Duration::from_secs);
        let listen_timeout = parse_env(&env, "APX_LISTEN_TIMEOUT_SECS")?
            .or(fc.voice.listen_timeout_secs)
            .map_or(defaults.listen_timeout, Duration::from_secs);

        let voice = VoiceConfig {
            enabled,
            language: env("APX_VOICE_LANGUAGE")
                .or(fc.voice.language)
                .unwrap_or(defaults.language),
            stt_provider,
            stt_model: env("APX_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| stt_provider.default_model().to_string()),
            tts_provider,
            tts_model: env("APX_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| tts_provider.default_model().to_string()),
            tts_voice: env("APX_TTS_VOICE")
                .or(fc.voice.tts_voice)
                .unwrap_or(defaults.tts_voice),
            speed,
            pitch: defaults.pitch,
            volume,
            max_utterance,
            listen_timeout,
        };

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
            elevenlabs: env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
        };

        let data_dir = env("APX_DATA_DIR")
            .or(fc.persistence.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let persistence_enabled = parse_env(&env, "APX_PERSIST")?
            .or(fc.persistence.enabled)
            .unwrap_or(true);

        let cancel_grace = Duration::from_millis(
            fc.session
                .cancel_grace_ms
                .unwrap_or(DEFAULT_CANCEL_GRACE_MS),
        );

        Ok(Self {
            backend,
            voice,
            api_keys,
            data_dir,
            persistence_enabled,
            cancel_grace,
        })
    }

    /// Path of the conversation database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("apx.db")
    }

    /// Path of the anonymous identity file
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }
}

/// Parse an optional environment value
fn parse_env<F, T>(env: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {key}={raw}: {e}")))
        })
        .transpose()
}
