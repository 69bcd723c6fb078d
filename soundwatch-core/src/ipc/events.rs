//! Events broadcast by `SoundwatchEngine`.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `DetectionEvent` | `SoundwatchEngine::subscribe_detections` |
//! | `EngineStatusEvent` | `SoundwatchEngine::subscribe_status` |

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Detection events
// ---------------------------------------------------------------------------

/// Emitted once per window classified as a target (non-background) label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Detected class, e.g. `"Siren"`.
    pub label: String,
    /// Model output index of the label.
    pub index: usize,
    /// Raw model score for the winning class.
    pub score: f32,
    /// Wall-clock time of the detection, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl DetectionEvent {
    pub fn new(seq: u64, label: impl Into<String>, index: usize, score: f32) -> Self {
        Self {
            seq,
            label: label.into(),
            index,
            score,
            timestamp_ms: now_ms(),
        }
    }

    /// User-facing notification body.
    pub fn message(&self) -> String {
        format!("Detected sound: {}", self.label)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// No capture session; a model may or may not be loaded.
    Idle,
    /// Loading the model and running the warm-up inference.
    Loading,
    /// Capturing and classifying.
    Listening,
    /// Capture session ended (stopped or source exhausted).
    Stopped,
    /// Model load or capture session failed.
    Error,
}
