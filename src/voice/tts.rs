//! Text-to-speech (TTS) processing

use std::str::FromStr;

use crate::{Error, Result};

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

impl TtsProvider {
    /// Model used when none is configured
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAI => "tts-1",
            Self::ElevenLabs => "eleven_monolingual_v1",
        }
    }
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Synthesizes speech from text
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    speed: f64,
    pitch: f32,
    model: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a new TTS instance
    ///
    /// `speed` is fixed for the lifetime of the instance. `ElevenLabs`
    /// ignores it.
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(
        provider: TtsProvider,
        api_key: String,
        voice: String,
        model: String,
        speed: f64,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(format!("{provider:?} API key required for TTS")));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            speed,
            pitch: 1.0,
            model,
            provider,
        })
    }

    /// Set the voice pitch multiplier
    ///
    /// Neither provider accepts a pitch parameter, so the value is only
    /// recorded alongside each synthesis.
    #[must_use]
    pub const fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }

    /// Pitch multiplier requested for this voice
    #[must_use]
    pub const fn pitch(&self) -> f32 {
        self.pitch
    }

    /// Synthesize text to speech
    ///
    /// # Returns
    ///
    /// Audio bytes (MP3 format)
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        tracing::debug!(
            provider = ?self.provider,
            speed = self.speed,
            pitch = self.pitch,
            chars = text.len(),
            "synthesizing speech"
        );
        match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text).await,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await,
        }
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f64,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "mp3",
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), "speech synthesized");
        Ok(audio.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{}", self.voice);

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}
