//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not block, perform I/O, or allocate after its first invocation.
//! It therefore only downmixes to mono and pushes into the SPSC ring; all
//! resampling and windowing happen in [`MicrophoneSource::read`] on the
//! worker thread.
//!
//! The microphone is opened with a stream that stays gated until `start`;
//! `stop` pauses the stream and closes the gate, and `release` (or `Drop`)
//! drops the stream, which hands the device back to the OS.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, SizedSample, Stream, StreamConfig, SupportedBufferSize,
};
use tracing::{debug, error, info, warn};

use super::{
    device::backend_error, resample::RateConverter, AudioSource, CaptureFormat, SourceState,
};
use crate::{
    buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, Producer},
    error::{Result, SoundwatchError},
    session::SessionFlag,
};

/// How long `read` sleeps when the ring is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Samples drained from the ring per poll (20 ms at 48 kHz).
const DRAIN_BLOCK: usize = 960;

/// Options for opening the microphone.
#[derive(Debug, Clone)]
pub struct MicrophoneOptions {
    /// Exact device name to prefer; falls back to the default input and then
    /// the first available input.
    pub preferred_device: Option<String>,
    /// A `read` that receives no audio for this long fails with `IoFailure`.
    /// The wait restarts whenever samples arrive, so windows longer than the
    /// timeout still fill.
    pub read_timeout: Duration,
}

impl Default for MicrophoneOptions {
    fn default() -> Self {
        Self {
            preferred_device: None,
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// Live microphone source.
///
/// **Not `Send`**: create, read and drop it on the same OS thread.
pub struct MicrophoneSource {
    /// `None` once released.
    stream: Option<Stream>,
    consumer: AudioConsumer,
    /// Callback gate: samples are discarded while `false`.
    capturing: Arc<AtomicBool>,
    /// Raised by the stream error callback, cleared by the next `read`.
    stream_fault: Arc<AtomicBool>,
    /// Samples the callback could not fit into the ring; reported by `read`.
    dropped: Arc<AtomicUsize>,
    session: SessionFlag,
    converter: RateConverter,
    /// Converted samples not yet handed to a caller.
    staged: Vec<f32>,
    drain: Vec<f32>,
    format: CaptureFormat,
    min_buffer_len: usize,
    read_timeout: Duration,
    state: SourceState,
    device_name: String,
}

impl MicrophoneSource {
    /// Acquire an input device and build a (gated) capture stream for
    /// `format`.
    ///
    /// # Errors
    /// - `DeviceUnavailable` when no input device exists, the format is not
    ///   mono f32, or the stream cannot be built.
    /// - `PermissionDenied` when the OS refuses microphone access.
    pub fn open(
        format: CaptureFormat,
        session: SessionFlag,
        options: MicrophoneOptions,
    ) -> Result<Self> {
        format.validate()?;

        let host = cpal::default_host();
        let device = select_device(&host, options.preferred_device.as_deref())?;
        let device_name = device.name().unwrap_or_default();

        let supported = negotiate_config(&device, format.sample_rate)?;
        let device_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let min_buffer_len = match supported.buffer_size() {
            SupportedBufferSize::Range { min, .. } => {
                frames_at_rate(*min as usize, device_rate, format.sample_rate)
            }
            SupportedBufferSize::Unknown => 0,
        };

        info!(
            device = device_name.as_str(),
            device_rate,
            channels,
            sample_format = ?supported.sample_format(),
            min_buffer_len,
            "opening microphone"
        );

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(device_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) = create_audio_ring();
        let capturing = Arc::new(AtomicBool::new(false));
        let stream_fault = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicUsize::new(0));
        let shared = CallbackShared {
            capturing: Arc::clone(&capturing),
            stream_fault: Arc::clone(&stream_fault),
            dropped: Arc::clone(&dropped),
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_mono_stream::<f32>(
                &device,
                &config,
                producer,
                shared.clone(),
                |s| s,
            ),
            SampleFormat::I16 => build_mono_stream::<i16>(
                &device,
                &config,
                producer,
                shared.clone(),
                |s| s as f32 / 32_768.0,
            ),
            SampleFormat::U8 => build_mono_stream::<u8>(
                &device,
                &config,
                producer,
                shared.clone(),
                |s| (s as f32 - 128.0) / 128.0,
            ),
            fmt => {
                return Err(SoundwatchError::DeviceUnavailable(format!(
                    "unsupported device sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| backend_error("build input stream", e))?;

        let converter = RateConverter::new(device_rate, format.sample_rate, DRAIN_BLOCK)?;

        Ok(Self {
            stream: Some(stream),
            consumer,
            capturing,
            stream_fault,
            dropped,
            session,
            converter,
            staged: Vec::new(),
            drain: vec![0.0; DRAIN_BLOCK],
            format,
            min_buffer_len,
            read_timeout: options.read_timeout,
            state: SourceState::Opened,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Move staged samples into `out`, returning how many were copied.
    fn take_staged(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.staged.len());
        out[..n].copy_from_slice(&self.staged[..n]);
        self.staged.drain(..n);
        n
    }
}

impl AudioSource for MicrophoneSource {
    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn min_buffer_len(&self) -> usize {
        self.min_buffer_len
    }

    fn state(&self) -> SourceState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        match self.state {
            SourceState::Opened => {}
            SourceState::Released => return Err(SoundwatchError::AlreadyClosed),
            SourceState::Started | SourceState::Stopped => {
                return Err(SoundwatchError::AlreadyStarted)
            }
        }
        let stream = self.stream.as_ref().ok_or(SoundwatchError::AlreadyClosed)?;
        self.capturing.store(true, Ordering::Release);
        stream.play().map_err(|e| {
            self.capturing.store(false, Ordering::Release);
            backend_error("start input stream", e)
        })?;
        self.state = SourceState::Started;
        info!(device = self.device_name.as_str(), "microphone capture started");
        Ok(())
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        match self.state {
            SourceState::Started => {}
            SourceState::Stopped => return Ok(0),
            SourceState::Released => return Err(SoundwatchError::AlreadyClosed),
            SourceState::Opened => {
                return Err(SoundwatchError::IoFailure("microphone not started".into()))
            }
        }

        let lost = self.dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            warn!(lost, "capture ring overflowed; samples dropped");
        }

        let mut deadline = Instant::now() + self.read_timeout;
        let mut filled = 0;
        loop {
            filled += self.take_staged(&mut buf[filled..]);
            if filled == buf.len() {
                return Ok(filled);
            }

            if !self.session.is_active() {
                debug!(filled, "session cancelled during read; stopping microphone");
                self.stop();
                return Ok(filled);
            }

            if self.stream_fault.swap(false, Ordering::AcqRel) {
                return Err(SoundwatchError::IoFailure(
                    "input stream reported an error".into(),
                ));
            }

            let n = self.consumer.pop_slice(&mut self.drain);
            if n == 0 {
                if Instant::now() >= deadline {
                    return Err(SoundwatchError::IoFailure(format!(
                        "no audio received within {:?}",
                        self.read_timeout
                    )));
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            deadline = Instant::now() + self.read_timeout;
            self.converter.process_into(&self.drain[..n], &mut self.staged);
        }
    }

    fn stop(&mut self) {
        if !matches!(self.state, SourceState::Opened | SourceState::Started) {
            return;
        }
        self.capturing.store(false, Ordering::Release);
        if let Some(stream) = self.stream.as_ref() {
            if let Err(e) = stream.pause() {
                warn!("failed to pause input stream: {e}");
            }
        }
        self.state = SourceState::Stopped;
        info!(device = self.device_name.as_str(), "microphone capture stopped");
    }

    fn release(&mut self) {
        if self.state == SourceState::Released {
            return;
        }
        self.stop();
        self.stream = None;
        self.staged.clear();
        self.state = SourceState::Released;
        info!(device = self.device_name.as_str(), "microphone released");
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn select_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(preferred_name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) = devices.find(|d| {
                    d.name().map(|name| name == preferred_name).unwrap_or(false)
                }) {
                    return Ok(device);
                }
                warn!(
                    "preferred input device '{}' not found, falling back",
                    preferred_name
                );
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }

    let mut devices = host
        .input_devices()
        .map_err(|e| backend_error("enumerate input devices", e))?;
    let fallback = devices.next().ok_or_else(|| {
        SoundwatchError::DeviceUnavailable("no audio input device found".into())
    })?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

/// Prefer a native mono f32 config at the requested rate; otherwise take the
/// device default and resample.
fn negotiate_config(
    device: &cpal::Device,
    sample_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    if let Ok(mut ranges) = device.supported_input_configs() {
        if let Some(range) = ranges.find(|r| {
            r.channels() == 1
                && r.sample_format() == SampleFormat::F32
                && r.min_sample_rate().0 <= sample_rate
                && r.max_sample_rate().0 >= sample_rate
        }) {
            return Ok(range.with_sample_rate(SampleRate(sample_rate)));
        }
    }
    device
        .default_input_config()
        .map_err(|e| backend_error("query default input config", e))
}

/// Convert a frame count at `from_rate` to the equivalent count at
/// `to_rate`, rounding up.
fn frames_at_rate(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == 0 {
        return frames;
    }
    (frames * to_rate as usize).div_ceil(from_rate as usize)
}

/// Flags shared between the source and its stream callbacks.
#[derive(Clone)]
struct CallbackShared {
    capturing: Arc<AtomicBool>,
    stream_fault: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
}

fn build_mono_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    shared: CallbackShared,
    to_f32: fn(T) -> f32,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let CallbackShared {
        capturing,
        stream_fault,
        dropped,
    } = shared;
    let mut mono: Vec<f32> = Vec::new();

    device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            if !capturing.load(Ordering::Relaxed) {
                return;
            }
            let frames = data.len() / channels;
            mono.resize(frames, 0.0);
            for (slot, frame) in mono.iter_mut().zip(data.chunks_exact(channels)) {
                *slot = frame.iter().map(|s| to_f32(*s)).sum::<f32>() / channels as f32;
            }
            let written = producer.push_slice(&mono);
            if written < mono.len() {
                dropped.fetch_add(mono.len() - written, Ordering::Relaxed);
            }
        },
        move |err| {
            error!("audio stream error: {err}");
            stream_fault.store(true, Ordering::Release);
        },
        None,
    )
}
