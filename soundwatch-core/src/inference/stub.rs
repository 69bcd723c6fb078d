//! `ThresholdModel`: placeholder backend that needs no model file.
//!
//! Scores a window by its sample sum: `[1, 0]` (background) when the sum is
//! at or below the threshold, `[0, 1]` (siren) above it. Deterministic, so
//! the full capture → classify → notify path can be exercised end-to-end
//! without ONNX Runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::inference::SoundModel;

pub struct ThresholdModel {
    input_len: usize,
    threshold: f32,
    live: Option<Arc<AtomicUsize>>,
}

impl ThresholdModel {
    pub fn new(input_len: usize, threshold: f32) -> Self {
        debug!(input_len, threshold, "ThresholdModel created");
        Self {
            input_len,
            threshold,
            live: None,
        }
    }

    /// Like [`ThresholdModel::new`], but counts itself in `live` for as long
    /// as it exists. Lets callers check that unloading drops the backend.
    pub fn tracked(input_len: usize, threshold: f32, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        let mut model = Self::new(input_len, threshold);
        model.live = Some(live);
        model
    }
}

impl Drop for ThresholdModel {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl SoundModel for ThresholdModel {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn scores(&mut self, window: &[f32]) -> Result<Vec<f32>> {
        let sum: f32 = window.iter().sum();
        Ok(if sum > self.threshold {
            vec![0.0, 1.0]
        } else {
            vec![1.0, 0.0]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_by_sum() {
        let mut model = ThresholdModel::new(4, 1.0);
        assert_eq!(model.scores(&[0.0; 4]).unwrap(), vec![1.0, 0.0]);
        assert_eq!(model.scores(&[1.0; 4]).unwrap(), vec![0.0, 1.0]);
        assert_eq!(model.scores(&[0.25; 4]).unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn tracked_model_counts_itself() {
        let live = Arc::new(AtomicUsize::new(0));
        let model = ThresholdModel::tracked(4, 0.0, Arc::clone(&live));
        assert_eq!(live.load(Ordering::SeqCst), 1);
        drop(model);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
