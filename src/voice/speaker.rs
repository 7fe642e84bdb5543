//! Playback adapters: synthesized speech and text-only output

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::PlaybackDevice;
use super::playback::AudioPlayback;
use super::tts::TextToSpeech;
use crate::ConversationError;

/// Speaks replies through the default output device
pub struct SpeakerPlayback {
    tts: Arc<TextToSpeech>,
    volume: f32,
}

impl SpeakerPlayback {
    /// Create a playback adapter backed by `tts` at a fixed output gain
    #[must_use]
    pub const fn new(tts: Arc<TextToSpeech>, volume: f32) -> Self {
        Self { tts, volume }
    }
}

#[async_trait]
impl PlaybackDevice for SpeakerPlayback {
    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<(), ConversationError> {
        let audio = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = self.tts.synthesize(text) => result
                .map_err(|e| ConversationError::PlaybackUnavailable(e.to_string()))?,
        };

        let volume = self.volume;
        let token = cancel.clone();

        // cpal streams aren't Send, the output lives on a blocking thread
        let end = tokio::task::spawn_blocking(move || {
            let output = AudioPlayback::new(volume)?;
            output.play_mp3_blocking(&audio, &token)
        })
        .await
        .map_err(|e| ConversationError::PlaybackUnavailable(e.to_string()))?
        .map_err(|e| ConversationError::PlaybackUnavailable(e.to_string()))?;

        tracing::debug!(?end, "speech output released");
        Ok(())
    }
}

/// Text-only output: the reply is already in the transcript, nothing is voiced
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePlayback;

#[async_trait]
impl PlaybackDevice for ConsolePlayback {
    async fn speak(&self, text: &str, _cancel: CancellationToken) -> Result<(), ConversationError> {
        tracing::trace!(chars = text.len(), "text-only reply");
        Ok(())
    }
}
