//! Sound classification.
//!
//! The `SoundModel` trait decouples the classifier from any specific backend
//! (ONNX graph, threshold stub, ...). A backend is one loaded graph: it
//! knows its input length and turns one window into a raw score vector.
//! Everything else (lifecycle, label mapping, argmax) lives in
//! [`classifier::Classifier`].
//!
//! `&mut self` on `scores` expresses that inference sessions are not assumed
//! safe for concurrent use; all calls are serialised through
//! `ClassifierHandle`'s `parking_lot::Mutex`.

pub mod classifier;
pub mod labels;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxModel, OnnxModelConfig};

pub use classifier::{Classification, Classifier, ClassifierHandle, ClassifierState};
pub use labels::LabelTable;

use crate::error::Result;

/// Contract for inference backends.
pub trait SoundModel: Send + 'static {
    /// Number of samples one input window must contain (`N` in `[1, 1, N]`).
    fn input_len(&self) -> usize;

    /// Run the graph on one window and return its raw output scores, one per
    /// class.
    ///
    /// Callers guarantee `window.len() == self.input_len()`.
    ///
    /// # Errors
    /// Backend-specific failures, reported as `SoundwatchError::Inference`.
    fn scores(&mut self, window: &[f32]) -> Result<Vec<f32>>;
}

impl SoundModel for Box<dyn SoundModel> {
    fn input_len(&self) -> usize {
        (**self).input_len()
    }

    fn scores(&mut self, window: &[f32]) -> Result<Vec<f32>> {
        (**self).scores(window)
    }
}
