//! Microphone input stream

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Capture rate expected by the speech recognizers
pub const SAMPLE_RATE: u32 = 16000;

/// Mono 16 kHz recording from the default input device
///
/// Samples accumulate in a shared buffer drained with [`take_buffer`].
/// The microphone is held only while a stream is open: [`stop`] closes it,
/// and dropping the capture closes it on every other path (early return,
/// panic unwinding). Streams are not `Send` on every platform, so create
/// and drop the capture on the thread that records.
///
/// [`take_buffer`]: AudioCapture::take_buffer
/// [`stop`]: AudioCapture::stop
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    samples: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Resolve the default input device and a mono 16 kHz configuration
    ///
    /// Does not open the microphone yet.
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if there is no input device or it cannot
    /// record mono audio at [`SAMPLE_RATE`]
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let rate = SampleRate(SAMPLE_RATE);
        let config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1 && (c.min_sample_rate()..=c.max_sample_rate()).contains(&rate)
            })
            .ok_or_else(|| Error::Audio("input device cannot record mono 16 kHz".to_string()))?
            .with_sample_rate(rate)
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            "microphone resolved"
        );

        Ok(Self {
            device,
            config,
            samples: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Open the microphone and begin buffering samples
    ///
    /// Calling it while already recording is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the stream cannot be built or started;
    /// a permission refusal surfaces here
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let samples = Arc::clone(&self.samples);
        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = samples.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| tracing::error!(error = %err, "microphone stream error"),
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("microphone opened");
        Ok(())
    }

    /// Close the microphone, keeping any buffered samples
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("microphone released");
        }
    }

    /// Drain the samples recorded since the last call
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.samples
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Encode mono samples as 16-bit PCM WAV for upload to a recognizer
///
/// Samples outside `[-1.0, 1.0]` saturate at the 16-bit range.
///
/// # Errors
///
/// Returns `Error::Audio` if encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let audio_err = |e: hound::Error| Error::Audio(e.to_string());

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(audio_err)?;
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let pcm = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer.write_sample(pcm).map_err(audio_err)?;
    }
    writer.finalize().map_err(audio_err)?;

    Ok(cursor.into_inner())
}
