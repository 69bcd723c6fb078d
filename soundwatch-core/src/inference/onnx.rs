//! ONNX backend via the `ort` crate.
//!
//! Targets single-input waveform classifiers: input `[1, 1, N]` f32 samples
//! at the capture rate, output one score per class (any shape, flattened).
//! `N` is read from the graph. A dynamic last dimension is resolved from
//! [`OnnxModelConfig::window_len`]; without it the model is rejected.
//!
//! Session threading can be tuned with `SOUNDWATCH_ORT_INTRA_THREADS`.

use std::path::Path;

use ndarray::ArrayView3;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::value::TensorRef;
use tracing::{debug, info};

use crate::error::{Result, SoundwatchError};
use crate::inference::SoundModel;

#[derive(Debug, Clone, Default)]
pub struct OnnxModelConfig {
    /// Window length used when the graph's last input dimension is dynamic.
    /// When the graph fixes `N`, this must agree with it.
    pub window_len: Option<usize>,
    /// Intra-op thread count; defaults to half the logical cores (1..=4).
    pub intra_threads: Option<usize>,
}

pub struct OnnxModel {
    session: Session,
    input_name: String,
    output_name: String,
    input_len: usize,
}

fn load_error(e: impl std::fmt::Display) -> SoundwatchError {
    SoundwatchError::ModelLoad(e.to_string())
}

fn inference_error(e: impl std::fmt::Display) -> SoundwatchError {
    SoundwatchError::Inference(e.to_string())
}

fn intra_threads(config: &OnnxModelConfig) -> usize {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    std::env::var("SOUNDWATCH_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .or(config.intra_threads)
        .unwrap_or(logical_cores / 2)
        .clamp(1, 4)
}

/// Resolve `N` from a `[1, 1, N]` input shape. Negative dimensions are
/// dynamic.
fn resolve_input_len(shape: &[i64], configured: Option<usize>) -> Result<usize> {
    let [batch, channels, len] = shape else {
        return Err(SoundwatchError::ModelLoad(format!(
            "expected input shape [1, 1, N], got {shape:?}"
        )));
    };
    if !matches!(*batch, 1 | -1) || !matches!(*channels, 1 | -1) {
        return Err(SoundwatchError::ModelLoad(format!(
            "expected input shape [1, 1, N], got {shape:?}"
        )));
    }
    match (*len, configured) {
        (n, Some(window)) if n > 0 && n as usize != window => {
            Err(SoundwatchError::ModelLoad(format!(
                "model expects {n} samples per window, configured window is {window}"
            )))
        }
        (n, _) if n > 0 => Ok(n as usize),
        (_, Some(window)) if window > 0 => Ok(window),
        _ => Err(SoundwatchError::ModelLoad(
            "model input length is dynamic and no window length is configured".into(),
        )),
    }
}

impl OnnxModel {
    /// Read a model file from disk.
    ///
    /// # Errors
    /// `ModelNotFound` when the file is missing, `ModelLoad` for anything the
    /// runtime rejects.
    pub fn from_path(path: impl AsRef<Path>, config: OnnxModelConfig) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SoundwatchError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        let bytes = std::fs::read(path)?;
        info!(
            path = %path.display(),
            size_mb = format_args!("{:.2}", bytes.len() as f64 / (1024.0 * 1024.0)),
            "loading ONNX model"
        );
        Self::from_bytes(&bytes, config)
    }

    /// Build a session from in-memory model bytes.
    pub fn from_bytes(model_bytes: &[u8], config: OnnxModelConfig) -> Result<Self> {
        let intra_threads = intra_threads(&config);
        let session = SessionBuilder::new()
            .map_err(load_error)?
            .with_intra_threads(intra_threads)
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::All)
            .map_err(load_error)?
            .commit_from_memory(model_bytes)
            .map_err(load_error)?;

        let input = session
            .inputs()
            .first()
            .ok_or_else(|| SoundwatchError::ModelLoad("model declares no inputs".into()))?;
        let input_name = input.name().to_string();
        let shape: Vec<i64> = input
            .dtype()
            .tensor_shape()
            .map(|s| s.iter().copied().collect())
            .ok_or_else(|| {
                SoundwatchError::ModelLoad(format!("input '{input_name}' is not a tensor"))
            })?;
        let input_len = resolve_input_len(&shape, config.window_len)?;

        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| SoundwatchError::ModelLoad("model declares no outputs".into()))?;

        info!(
            input = %input_name,
            output = %output_name,
            input_len,
            intra_threads,
            "ONNX session ready"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            input_len,
        })
    }
}

impl SoundModel for OnnxModel {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn scores(&mut self, window: &[f32]) -> Result<Vec<f32>> {
        if window.len() != self.input_len {
            return Err(SoundwatchError::Inference(format!(
                "window has {} samples, model expects {}",
                window.len(),
                self.input_len
            )));
        }

        // Zero-copy [1, 1, N] view over the caller's window.
        let view = ArrayView3::from_shape((1, 1, window.len()), window).map_err(inference_error)?;
        let tensor = TensorRef::from_array_view(view).map_err(inference_error)?;
        let inputs: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.input_name.clone(), SessionInputValue::from(tensor))];

        let outputs = self.session.run(inputs).map_err(inference_error)?;
        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(inference_error)?;
        debug!(?shape, classes = data.len(), "ONNX inference");
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_input_length_is_used() {
        assert_eq!(resolve_input_len(&[1, 1, 15_600], None).unwrap(), 15_600);
        assert_eq!(resolve_input_len(&[-1, 1, 8_000], Some(8_000)).unwrap(), 8_000);
    }

    #[test]
    fn dynamic_length_needs_configured_window() {
        assert_eq!(resolve_input_len(&[1, 1, -1], Some(16_000)).unwrap(), 16_000);
        assert!(matches!(
            resolve_input_len(&[1, 1, -1], None),
            Err(SoundwatchError::ModelLoad(_))
        ));
    }

    #[test]
    fn rejects_wrong_rank_or_mismatched_window() {
        assert!(resolve_input_len(&[1, 16_000], None).is_err());
        assert!(resolve_input_len(&[2, 1, 16_000], None).is_err());
        assert!(resolve_input_len(&[1, 1, 16_000], Some(8_000)).is_err());
    }

    #[test]
    fn garbage_bytes_fail_to_load() {
        let err = OnnxModel::from_bytes(b"not an onnx graph", OnnxModelConfig::default())
            .err()
            .expect("garbage must not load");
        assert!(matches!(err, SoundwatchError::ModelLoad(_)));
    }
}
