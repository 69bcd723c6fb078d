//! `ClipSource`: serves a pre-recorded clip window by window.
//!
//! Used for offline classification of WAV files and as a deterministic
//! source in tests. When the clip runs out the source stops itself, which
//! the worker loop reports as an exhausted source rather than an error.

use std::path::Path;

use hound::{SampleFormat, WavReader};
use tracing::info;

use super::{resample::RateConverter, AudioSource, CaptureFormat, SourceState};
use crate::error::{Result, SoundwatchError};

/// Block size used when converting a clip to the capture rate.
const CONVERT_BLOCK: usize = 1024;

pub struct ClipSource {
    samples: Vec<f32>,
    cursor: usize,
    format: CaptureFormat,
    state: SourceState,
}

impl ClipSource {
    /// Serve `samples`, which must already be mono at `format.sample_rate`.
    pub fn new(samples: Vec<f32>, format: CaptureFormat) -> Self {
        Self {
            samples,
            cursor: 0,
            format,
            state: SourceState::Opened,
        }
    }

    /// Decode a WAV file, downmix it to mono and convert it to
    /// `format.sample_rate`.
    ///
    /// # Errors
    /// - `DeviceUnavailable` when the file is missing or the capture format
    ///   is not mono f32.
    /// - `Wav` for undecodable files.
    pub fn from_wav(path: impl AsRef<Path>, format: CaptureFormat) -> Result<Self> {
        format.validate()?;
        let path = path.as_ref();
        if !path.exists() {
            return Err(SoundwatchError::DeviceUnavailable(format!(
                "audio clip not found: {}",
                path.display()
            )));
        }

        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            SampleFormat::Int => {
                let scale = 1.0 / (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let mono = downmix(&interleaved, channels);
        let mut converter = RateConverter::new(spec.sample_rate, format.sample_rate, CONVERT_BLOCK)?;
        let samples = converter.convert_all(&mono);

        info!(
            path = %path.display(),
            source_rate = spec.sample_rate,
            channels,
            samples = samples.len(),
            seconds = format_args!("{:.2}", samples.len() as f64 / format.sample_rate as f64),
            "loaded audio clip"
        );

        Ok(Self::new(samples, format))
    }

    /// Samples not yet handed out.
    pub fn remaining(&self) -> usize {
        self.samples.len().saturating_sub(self.cursor)
    }
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

impl AudioSource for ClipSource {
    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn min_buffer_len(&self) -> usize {
        0
    }

    fn state(&self) -> SourceState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        match self.state {
            SourceState::Opened => {
                self.state = SourceState::Started;
                Ok(())
            }
            SourceState::Released => Err(SoundwatchError::AlreadyClosed),
            SourceState::Started | SourceState::Stopped => Err(SoundwatchError::AlreadyStarted),
        }
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        match self.state {
            SourceState::Started => {}
            SourceState::Stopped => return Ok(0),
            SourceState::Released => return Err(SoundwatchError::AlreadyClosed),
            SourceState::Opened => {
                return Err(SoundwatchError::IoFailure("clip source not started".into()))
            }
        }

        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.samples[self.cursor..self.cursor + n]);
        self.cursor += n;
        if self.remaining() == 0 {
            self.state = SourceState::Stopped;
        }
        Ok(n)
    }

    fn stop(&mut self) {
        if self.state != SourceState::Released {
            self.state = SourceState::Stopped;
        }
    }

    fn release(&mut self) {
        self.state = SourceState::Released;
        self.samples = Vec::new();
        self.cursor = 0;
    }
}
