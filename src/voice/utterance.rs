//! End-of-utterance detection
//!
//! Energy-based speech activity detection that decides when a single
//! spoken request has finished.

use std::time::Duration;

use super::SAMPLE_RATE;

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech for a complete utterance (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Silence duration to consider end of utterance (in samples)
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// State of the utterance detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech to begin
    Waiting,
    /// Speech detected, accumulating
    Speaking,
    /// Speech followed by silence, or the length limit was reached
    Complete,
    /// No speech before the listen timeout
    TimedOut,
}

/// Detects the boundaries of one utterance
pub struct UtteranceDetector {
    state: DetectorState,
    speech_buffer: Vec<f32>,
    silence_counter: usize,
    waited: usize,
    listen_limit: usize,
    max_samples: usize,
}

impl UtteranceDetector {
    /// Create a detector that gives up after `listen_timeout` without speech
    /// and cuts utterances at `max_utterance`
    #[must_use]
    pub fn new(listen_timeout: Duration, max_utterance: Duration) -> Self {
        Self {
            state: DetectorState::Waiting,
            speech_buffer: Vec::new(),
            silence_counter: 0,
            waited: 0,
            listen_limit: duration_to_samples(listen_timeout),
            max_samples: duration_to_samples(max_utterance).max(MIN_SPEECH_SAMPLES),
        }
    }

    /// Feed a frame of samples and return the resulting state
    pub fn process(&mut self, samples: &[f32]) -> DetectorState {
        let energy = calculate_energy(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            DetectorState::Waiting => {
                if is_speech {
                    self.state = DetectorState::Speaking;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected");
                } else {
                    self.waited += samples.len();
                    if self.waited > self.listen_limit {
                        tracing::debug!(waited = self.waited, "no speech before listen timeout");
                        self.state = DetectorState::TimedOut;
                    }
                }
            }
            DetectorState::Speaking => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                tracing::trace!(
                    buffer_len = self.speech_buffer.len(),
                    silence = self.silence_counter,
                    is_speech,
                    energy,
                    "speaking state"
                );

                if self.speech_buffer.len() >= self.max_samples {
                    tracing::debug!(samples = self.speech_buffer.len(), "utterance length limit reached");
                    self.state = DetectorState::Complete;
                } else if self.silence_counter > SILENCE_SAMPLES
                    && self.speech_buffer.len() > MIN_SPEECH_SAMPLES + self.silence_counter
                {
                    tracing::debug!(samples = self.speech_buffer.len(), "utterance complete");
                    self.state = DetectorState::Complete;
                } else if self.silence_counter > SILENCE_SAMPLES {
                    // A short blip followed by silence, keep waiting for real speech
                    tracing::trace!("speech too short, waiting again");
                    self.waited += self.speech_buffer.len();
                    self.speech_buffer.clear();
                    self.silence_counter = 0;
                    self.state = DetectorState::Waiting;
                }
            }
            DetectorState::Complete | DetectorState::TimedOut => {}
        }

        self.state
    }

    /// Take the captured utterance, clearing it
    pub fn take_speech_buffer(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.speech_buffer)
    }

    /// Get the accumulated speech buffer
    #[must_use]
    pub fn speech_buffer(&self) -> &[f32] {
        &self.speech_buffer
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }
}

fn duration_to_samples(duration: Duration) -> usize {
    let samples = duration.as_millis() * u128::from(SAMPLE_RATE) / 1000;
    usize::try_from(samples).unwrap_or(usize::MAX)
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
