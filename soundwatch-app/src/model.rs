//! Picks and loads the classification backend for this run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use soundwatch_core::{
    LabelTable, OnnxModel, OnnxModelConfig, SoundModel, SoundwatchEngine,
    SoundwatchError, ThresholdModel,
};
use tracing::{info, warn};

use crate::settings::AppSettings;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChoice {
    Onnx {
        model: PathBuf,
        labels: Option<PathBuf>,
        window_len: Option<usize>,
    },
    Threshold {
        window_len: usize,
        threshold: f32,
    },
}

/// `force_stub` (an explicit `--stub-threshold`) wins over a configured
/// model path.
pub fn choose_model(settings: &AppSettings, force_stub: bool) -> ModelChoice {
    match settings.model_path.as_ref() {
        Some(model) if !force_stub => ModelChoice::Onnx {
            model: model.clone(),
            labels: settings.labels_path.clone(),
            window_len: settings.window_len,
        },
        _ => {
            if !force_stub {
                warn!("no model configured; using the threshold stub");
            }
            ModelChoice::Threshold {
                window_len: settings.effective_window_len(),
                threshold: settings.stub_threshold,
            }
        }
    }
}

pub fn load_model(engine: &SoundwatchEngine, choice: &ModelChoice) -> Result<()> {
    match choice {
        ModelChoice::Onnx {
            model,
            labels,
            window_len,
        } => {
            let labels = match labels {
                Some(path) => LabelTable::from_path(path)
                    .with_context(|| format!("loading labels from {}", path.display()))?,
                None => LabelTable::siren_default(),
            };
            if !model.exists() {
                return Err(SoundwatchError::ModelNotFound {
                    path: model.clone(),
                }
                .into());
            }
            let bytes = std::fs::read(model)
                .with_context(|| format!("reading model {}", model.display()))?;
            labels.verify_model(&bytes)?;

            let config = OnnxModelConfig {
                window_len: *window_len,
                ..OnnxModelConfig::default()
            };
            info!(model = %model.display(), classes = labels.len(), "loading ONNX classifier");
            engine
                .load_model(
                    move || Ok(Box::new(OnnxModel::from_bytes(&bytes, config)?) as Box<dyn SoundModel>),
                    labels,
                )
                .with_context(|| format!("loading model {}", model.display()))
        }
        ModelChoice::Threshold {
            window_len,
            threshold,
        } => {
            let (window_len, threshold) = (*window_len, *threshold);
            info!(window_len, threshold, "loading threshold stub classifier");
            engine
                .load_model(
                    move || Ok(Box::new(ThresholdModel::new(window_len, threshold)) as Box<dyn SoundModel>),
                    LabelTable::siren_default(),
                )
                .context("loading threshold stub")
        }
    }
}
