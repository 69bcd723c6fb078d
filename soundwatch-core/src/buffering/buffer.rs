//! Fixed-length capture window handed from the audio source to the classifier.

/// One capture window of mono PCM samples at a known sample rate.
///
/// The length is fixed at construction and never changes: the worker
/// allocates one buffer per session and reuses it for every read.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// A zeroed window of `len` samples.
    pub fn zeroed(len: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0.0; len],
            sample_rate,
        }
    }

    /// Wrap existing samples; the window length becomes `samples.len()`.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Mutable view used as the read target. The slice length is the window
    /// length, so a source can never grow or shrink the buffer.
    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Window duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Sum of all samples.
    pub fn sum(&self) -> f32 {
        self.samples.iter().sum()
    }
}
