//! Microphone capture adapter: one activation yields one transcript

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
use super::stt::SpeechToText;
use super::utterance::{DetectorState, UtteranceDetector};
use super::CaptureDevice;
use crate::{ConversationError, Error};

/// Audio processing chunk interval (100ms)
const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Records an utterance from the default input device and transcribes it
pub struct MicrophoneCapture {
    stt: Arc<SpeechToText>,
    listen_timeout: Duration,
    max_utterance: Duration,
}

impl MicrophoneCapture {
    /// Create a capture adapter backed by `stt`
    #[must_use]
    pub const fn new(stt: Arc<SpeechToText>, listen_timeout: Duration, max_utterance: Duration) -> Self {
        Self {
            stt,
            listen_timeout,
            max_utterance,
        }
    }
}

#[async_trait]
impl CaptureDevice for MicrophoneCapture {
    async fn capture(&self, cancel: CancellationToken) -> Result<String, ConversationError> {
        let token = cancel.clone();
        let listen_timeout = self.listen_timeout;
        let max_utterance = self.max_utterance;

        // cpal streams aren't Send, the microphone lives on a blocking thread
        let recorded = tokio::task::spawn_blocking(move || {
            record_utterance(&token, listen_timeout, max_utterance)
        })
        .await
        .map_err(|e| ConversationError::CaptureUnavailable(e.to_string()))??;

        // A cancelled capture reports nothing useful; the controller has already moved on
        let Some(samples) = recorded else {
            return Err(ConversationError::CaptureEmpty);
        };

        let wav = samples_to_wav(&samples, SAMPLE_RATE)
            .map_err(|e| ConversationError::CaptureUnavailable(e.to_string()))?;

        let transcript = tokio::select! {
            () = cancel.cancelled() => return Err(ConversationError::CaptureEmpty),
            result = self.stt.transcribe(&wav) => result.map_err(|e| {
                tracing::warn!(error = %e, "transcription failed");
                ConversationError::CaptureUnavailable(format!("speech recognition failed: {e}"))
            })?,
        };

        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(ConversationError::CaptureEmpty);
        }

        Ok(transcript.to_string())
    }
}

/// Engage the microphone until one utterance is complete
///
/// Returns `Ok(None)` when cancelled. The input stream is dropped before
/// this returns, whatever the outcome.
fn record_utterance(
    cancel: &CancellationToken,
    listen_timeout: Duration,
    max_utterance: Duration,
) -> Result<Option<Vec<f32>>, ConversationError> {
    let mut capture = AudioCapture::new().map_err(classify_device_error)?;
    capture.start().map_err(classify_device_error)?;
    tracing::debug!("microphone engaged");

    let mut detector = UtteranceDetector::new(listen_timeout, max_utterance);
    // Backstop in case the device stops delivering frames
    let hard_limit = listen_timeout + max_utterance + Duration::from_secs(1);
    let started = Instant::now();

    let result = loop {
        if cancel.is_cancelled() {
            break Ok(None);
        }

        std::thread::sleep(FRAME_INTERVAL);

        let samples = capture.take_buffer();
        if !samples.is_empty() {
            match detector.process(&samples) {
                DetectorState::Complete => break Ok(Some(detector.take_speech_buffer())),
                DetectorState::TimedOut => break Err(ConversationError::CaptureEmpty),
                DetectorState::Waiting | DetectorState::Speaking => {}
            }
        }

        if started.elapsed() > hard_limit {
            tracing::warn!("input device stalled");
            break Err(ConversationError::CaptureEmpty);
        }
    };

    capture.stop();
    tracing::debug!("microphone released");
    result
}

/// Map a device error onto the capture taxonomy
fn classify_device_error(error: Error) -> ConversationError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        ConversationError::CapturePermissionDenied
    } else {
        ConversationError::CaptureUnavailable(message)
    }
}
