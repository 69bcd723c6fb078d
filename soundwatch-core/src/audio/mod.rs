//! Audio sources.
//!
//! An [`AudioSource`] hands out fixed-size windows of mono f32 PCM. `read`
//! blocks until the caller's buffer is full, the source is stopped, or the
//! session is cancelled; in the last two cases it returns a short (possibly
//! zero) count.
//!
//! ```text
//! open ──► Opened ──start──► Started ──stop──► Stopped ──release──► Released
//!                                 └───────────release──────────────────┘
//! ```
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so `AudioSource` carries no `Send` bound. Sources are created,
//! read and dropped on the worker thread; the engine receives a `Send`
//! factory instead of a source.

pub mod clip;
pub mod device;
pub mod level;
pub mod resample;

#[cfg(feature = "audio-cpal")]
pub mod microphone;

pub use clip::ClipSource;

#[cfg(feature = "audio-cpal")]
pub use microphone::{MicrophoneOptions, MicrophoneSource};

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SoundwatchError};

/// Requested capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFormat {
    /// Samples per second delivered by `read`.
    pub sample_rate: u32,
    /// Channels delivered by `read`. The pipeline only accepts mono.
    pub channels: u16,
    /// Bits per delivered sample. Only 32-bit float is supported.
    pub bits_per_sample: u16,
}

impl CaptureFormat {
    /// 16 kHz mono f32, the format the bundled siren model was trained on.
    pub const fn mono_f32(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bits_per_sample: 32,
        }
    }

    /// Reject formats no source in this crate can deliver.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SoundwatchError::DeviceUnavailable(
                "capture sample rate must be non-zero".into(),
            ));
        }
        if self.channels != 1 || self.bits_per_sample != 32 {
            return Err(SoundwatchError::DeviceUnavailable(format!(
                "unsupported capture format: {} channel(s), {}-bit (need mono 32-bit float)",
                self.channels, self.bits_per_sample
            )));
        }
        Ok(())
    }
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self::mono_f32(16_000)
    }
}

/// Lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    /// Device acquired, not capturing.
    Opened,
    /// Capturing; `read` delivers audio.
    Started,
    /// Capture halted (by request, cancellation, or end of input).
    Stopped,
    /// Device handed back. Terminal.
    Released,
}

/// Contract for anything that produces capture windows.
pub trait AudioSource {
    /// Format of the samples `read` delivers.
    fn format(&self) -> CaptureFormat;

    /// Smallest read buffer, in samples, the device can serve for this
    /// format. Callers must not allocate a smaller window.
    fn min_buffer_len(&self) -> usize;

    fn state(&self) -> SourceState;

    /// Begin capturing.
    ///
    /// # Errors
    /// `AlreadyStarted` when called twice, `AlreadyClosed` after `release`.
    fn start(&mut self) -> Result<()>;

    /// Fill `buf`, blocking until it is full or the source stops.
    ///
    /// Returns the number of samples written; fewer than `buf.len()` only
    /// when the source stopped (or the session was cancelled) mid-read.
    ///
    /// # Errors
    /// `IoFailure` when the device misbehaves or delivers nothing within the
    /// read timeout, `AlreadyClosed` after `release`.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;

    /// Halt capture. Idempotent; a no-op once released.
    fn stop(&mut self);

    /// Release the device. Idempotent.
    fn release(&mut self);
}

/// Scoped hold on a source: stops and releases it when dropped, including
/// on early return and unwinding.
pub struct CaptureGuard<'a> {
    source: &'a mut (dyn AudioSource + 'a),
}

impl<'a> CaptureGuard<'a> {
    pub fn new(source: &'a mut (dyn AudioSource + 'a)) -> Self {
        Self { source }
    }
}

impl<'a> Deref for CaptureGuard<'a> {
    type Target = dyn AudioSource + 'a;

    fn deref(&self) -> &Self::Target {
        self.source
    }
}

impl<'a> DerefMut for CaptureGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.source
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.source.stop();
        self.source.release();
        debug!(state = ?self.source.state(), "capture guard released source");
    }
}
