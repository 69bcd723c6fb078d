//! Sample-rate conversion to the classifier's capture rate.
//!
//! Microphones usually run at 44.1 or 48 kHz and WAV clips come at whatever
//! rate they were recorded with; the model wants 16 kHz mono f32. A
//! `RateConverter` sits on the worker thread (never in the audio callback)
//! and wraps a rubato `FastFixedIn` resampler.
//!
//! When the rates already match no rubato session is created and samples
//! pass straight through.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{Result, SoundwatchError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input not yet consumed by rubato (less than one block).
    pending: Vec<f32>,
    /// Input frames per rubato call.
    block: usize,
    /// Scratch output: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a converter from `source_rate` to `target_rate`, feeding rubato
    /// `block` input frames at a time.
    ///
    /// # Errors
    /// `SoundwatchError::Config` for a zero rate or block, and when rubato
    /// rejects the ratio.
    pub fn new(source_rate: u32, target_rate: u32, block: usize) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 || block == 0 {
            return Err(SoundwatchError::Config(format!(
                "invalid resampler parameters: {source_rate} Hz -> {target_rate} Hz, block {block}"
            )));
        }

        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block,
                scratch: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            target_rate as f64 / source_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| SoundwatchError::Config(format!("resampler init: {e}")))?;

        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];
        debug!(source_rate, target_rate, block, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            block,
            scratch,
        })
    }

    /// Feed samples and append every converted sample to `out`.
    ///
    /// Input shorter than one block is held back until the next call.
    pub fn process_into(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        let Some(ref mut resampler) = self.resampler else {
            out.extend_from_slice(samples);
            return;
        };

        self.pending.extend_from_slice(samples);

        let mut offset = 0;
        while self.pending.len() - offset >= self.block {
            let input = &self.pending[offset..offset + self.block];
            match resampler.process_into_buffer(&[input], &mut self.scratch, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            offset += self.block;
        }
        self.pending.drain(..offset);
    }

    /// Convenience wrapper around [`RateConverter::process_into`].
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        self.process_into(samples, &mut out);
        out
    }

    /// Flush the held-back tail at end of stream.
    pub fn finish_into(&mut self, out: &mut Vec<f32>) {
        let Some(ref mut resampler) = self.resampler else {
            return;
        };
        if self.pending.is_empty() {
            return;
        }
        let tail = std::mem::take(&mut self.pending);
        let input: [&[f32]; 1] = [tail.as_slice()];
        match resampler.process_partial_into_buffer(Some(&input[..]), &mut self.scratch, None) {
            Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
            Err(e) => error!("resampler flush error: {e}"),
        }
    }

    /// Convert a complete clip in one go.
    pub fn convert_all(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(samples.len());
        self.process_into(samples, &mut out);
        self.finish_into(&mut out);
        out
    }

    /// `true` when no resampling occurs.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
