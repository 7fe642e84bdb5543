//! Voice processing module
//!
//! Device seams for the session controller plus the concrete microphone
//! and speaker adapters. Speech recognition and synthesis run against
//! hosted APIs.

mod capture;
mod microphone;
mod playback;
mod speaker;
mod stt;
mod tts;
mod utterance;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::ConversationError;

pub use capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
pub use microphone::MicrophoneCapture;
pub use playback::{AudioPlayback, PLAYBACK_SAMPLE_RATE, PlaybackEnd, decode_mp3};
pub use speaker::{ConsolePlayback, SpeakerPlayback};
pub use stt::{SpeechToText, SttProvider};
pub use tts::{TextToSpeech, TtsProvider};
pub use utterance::{DetectorState, UtteranceDetector, calculate_energy};

/// Converts one spoken utterance into text
///
/// Each call engages the input device and must release it before
/// returning, including when `cancel` fires. Results produced after
/// cancellation are ignored by the caller.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Record and transcribe a single utterance
    ///
    /// # Errors
    ///
    /// Returns a capture error when the device is unavailable, access is
    /// denied, or nothing was said
    async fn capture(&self, cancel: CancellationToken) -> Result<String, ConversationError>;
}

/// Renders reply text audibly
///
/// Each call engages the output device and must release it before
/// returning. Cancellation stops output early and is not an error.
#[async_trait]
pub trait PlaybackDevice: Send + Sync {
    /// Speak `text` until finished or cancelled
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::PlaybackUnavailable`] when output fails
    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<(), ConversationError>;
}

/// Capture adapter for hosts without speech input
#[derive(Debug, Clone, Default)]
pub struct UnavailableCapture {
    reason: String,
}

impl UnavailableCapture {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CaptureDevice for UnavailableCapture {
    async fn capture(&self, _cancel: CancellationToken) -> Result<String, ConversationError> {
        Err(ConversationError::CaptureUnavailable(self.reason.clone()))
    }
}
