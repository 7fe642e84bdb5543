//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// How often the blocking playback loop checks for completion or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// Every sample was played
    Finished,
    /// Stopped early by cancellation
    Interrupted,
}

/// Plays audio to the default output device
pub struct AudioPlayback {
    config: StreamConfig,
    volume: f32,
}

impl AudioPlayback {
    /// Open the default output device at a fixed output gain
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(volume: f32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            volume,
            "audio playback initialized"
        );

        Ok(Self {
            config,
            volume: volume.clamp(0.0, 1.0),
        })
    }

    /// Play MP3 bytes until done or cancelled
    ///
    /// Blocks the calling thread; run it on a blocking task.
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails
    pub fn play_mp3_blocking(&self, mp3_data: &[u8], cancel: &CancellationToken) -> Result<PlaybackEnd> {
        let samples = decode_mp3(mp3_data)?;
        self.play_samples_blocking(samples, cancel)
    }

    /// Play samples until done or cancelled
    ///
    /// The output stream is dropped before returning on every path.
    ///
    /// # Errors
    ///
    /// Returns error if playback fails
    pub fn play_samples_blocking(&self, samples: Vec<f32>, cancel: &CancellationToken) -> Result<PlaybackEnd> {
        if samples.is_empty() {
            return Ok(PlaybackEnd::Finished);
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".to_string()))?;

        let channels = self.config.channels as usize;
        let volume = self.volume;
        let sample_count = samples.len();

        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let samples_cb = Arc::clone(&samples);
        let position_cb = Arc::clone(&position);
        let finished_cb = Arc::clone(&finished);

        let stream = device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position_cb.load(Ordering::Relaxed);

                    for frame in data.chunks_mut(channels) {
                        let sample = samples_cb.get(pos).map_or_else(
                            || {
                                finished_cb.store(true, Ordering::Release);
                                0.0
                            },
                            |s| {
                                pos += 1;
                                s * volume
                            },
                        );

                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }

                    position_cb.store(pos, Ordering::Relaxed);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
        let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);

        let end = loop {
            if cancel.is_cancelled() {
                break PlaybackEnd::Interrupted;
            }
            if finished.load(Ordering::Acquire) || Instant::now() > deadline {
                break PlaybackEnd::Finished;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        drop(stream);
        tracing::debug!(
            samples = sample_count,
            played = position.load(Ordering::Relaxed),
            ?end,
            "playback stopped"
        );

        Ok(end)
    }
}

/// Decode MP3 bytes to f32 samples
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                // Convert i16 samples to f32 and handle stereo to mono
                let frame_samples: Vec<f32> = if frame.channels == 2 {
                    frame
                        .data
                        .chunks(2)
                        .map(|chunk| {
                            let left = f32::from(chunk[0]) / 32768.0;
                            let right =
                                f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                            f32::midpoint(left, right)
                        })
                        .collect()
                } else {
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect()
                };

                samples.extend(frame_samples);
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}
