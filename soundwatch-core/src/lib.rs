//! # soundwatch-core
//!
//! Ambient sound event detection: capture audio, classify fixed windows with
//! a pre-trained model, notify on target labels (e.g. sirens).
//!
//! ## Architecture
//!
//! ```text
//! Microphone → cpal callback → SPSC RingBuffer → MicrophoneSource::read
//!                                                      │ (worker thread)
//!                                         AudioBuffer (model input length)
//!                                                      │
//!                                      Classifier → SoundModel::scores
//!                                                      │
//!                                      Event → EventNotifier / broadcast
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens on the worker.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod inference;
pub mod ipc;
pub mod notify;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{AudioSource, CaptureFormat, CaptureGuard, ClipSource, SourceState};
pub use buffering::buffer::AudioBuffer;
pub use engine::{EngineConfig, PipelineExit, PipelineMode, SoundwatchEngine};
pub use error::{Result, SoundwatchError};
pub use inference::{
    stub::ThresholdModel, Classification, Classifier, ClassifierHandle, ClassifierState,
    LabelTable, SoundModel,
};
pub use ipc::events::{DetectionEvent, EngineStatus, EngineStatusEvent};
pub use notify::{BroadcastNotifier, EventNotifier, FanoutNotifier, LogNotifier};
pub use session::SessionFlag;

#[cfg(feature = "audio-cpal")]
pub use audio::{MicrophoneOptions, MicrophoneSource};

#[cfg(feature = "onnx")]
pub use inference::{OnnxModel, OnnxModelConfig};
