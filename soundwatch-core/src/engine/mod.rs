//! `SoundwatchEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! SoundwatchEngine::new()
//!     └─► load_model()       → classifier Ready, status = Loading → Idle
//!         └─► start(factory) → source opened on the worker, status = Listening
//!             └─► stop()     → session cancelled, worker joined, status = Stopped
//!                 └─► shutdown() → model unloaded (process exit only)
//! ```
//!
//! Calling these in the wrong state returns an error rather than panicking.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). The source is therefore built by a `Send` factory *inside* the
//! worker thread so it never crosses a thread boundary. A sync oneshot
//! channel reports the open/start result back to the `start()` caller, so
//! permission and device errors surface before any capture begins.

pub mod failure;
pub mod pipeline;

use std::sync::{atomic::AtomicU64, mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{AudioSource, CaptureFormat},
    error::{Result, SoundwatchError},
    inference::{ClassifierHandle, ClassifierState, LabelTable, SoundModel},
    ipc::events::{DetectionEvent, EngineStatus, EngineStatusEvent},
    notify::{BroadcastNotifier, EventNotifier, FanoutNotifier},
    session::SessionFlag,
};

pub use failure::{FailureAction, FailureTracker};
pub use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics, PipelineExit};

/// Broadcast channel capacity: events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

const WORKER_THREAD_NAME: &str = "soundwatch-worker";

/// How capture and classification share threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineMode {
    /// Read and classify on the worker thread, one window at a time.
    #[default]
    Sequential,
    /// Capture on the worker thread, classify on a second thread, joined by a
    /// bounded queue of `depth` windows (clamped to 1..=2).
    Pipelined { depth: usize },
}

/// Configuration for `SoundwatchEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capture sample rate (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Capture channels. Only mono is supported. Default: 1.
    pub channels: u16,
    /// Expected window length in samples. `None` takes the model's input
    /// length; when set it must match it.
    pub window_len: Option<usize>,
    /// How long a microphone read waits for audio before failing.
    /// Default: 2 s.
    pub read_timeout: Duration,
    /// Consecutive transient failures before the session ends. Default: 3.
    pub max_consecutive_failures: u32,
    pub mode: PipelineMode,
    /// Windows quieter than this RMS skip inference. Default: off.
    pub silence_floor_rms: Option<f32>,
    /// Minimum gap between two notifications for the same label.
    /// Default: off (every detecting window notifies).
    pub notify_cooldown: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            window_len: None,
            read_timeout: Duration::from_secs(2),
            max_consecutive_failures: failure::DEFAULT_MAX_CONSECUTIVE_FAILURES,
            mode: PipelineMode::Sequential,
            silence_floor_rms: None,
            notify_cooldown: None,
        }
    }
}

impl EngineConfig {
    pub fn capture_format(&self) -> CaptureFormat {
        CaptureFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: 32,
        }
    }

    /// Resolve the session window length against the loaded model.
    pub fn resolve_window_len(&self, model_input_len: usize) -> Result<usize> {
        match self.window_len {
            Some(configured) if configured != model_input_len => Err(SoundwatchError::Config(
                format!(
                    "configured window of {configured} samples does not match model input of {model_input_len}"
                ),
            )),
            _ => Ok(model_input_len),
        }
    }
}

struct Worker {
    session: SessionFlag,
    handle: JoinHandle<Option<PipelineExit>>,
}

/// The top-level engine handle.
///
/// `SoundwatchEngine` is `Send + Sync`; all fields use interior mutability.
/// Wrap in `Arc<SoundwatchEngine>` to share with signal handlers and
/// event-forwarding tasks.
pub struct SoundwatchEngine {
    config: EngineConfig,
    classifier: ClassifierHandle,
    /// The running capture session, if any.
    worker: Mutex<Option<Worker>>,
    /// Canonical status (written via Mutex, read from any thread).
    status: Arc<Mutex<EngineStatus>>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    detection_tx: broadcast::Sender<DetectionEvent>,
    /// Receives every detection: the broadcast channel plus any extras.
    notifier: FanoutNotifier,
    /// Monotonically increasing detection sequence counter.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl SoundwatchEngine {
    /// Create a new engine. Does not load or capture; call `load_model()`
    /// then `start()`.
    pub fn new(config: EngineConfig, classifier: ClassifierHandle) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (detection_tx, _) = broadcast::channel(BROADCAST_CAP);
        let notifier =
            FanoutNotifier::new().with(Arc::new(BroadcastNotifier::new(detection_tx.clone())));

        Self {
            config,
            classifier,
            worker: Mutex::new(None),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            status_tx,
            detection_tx,
            notifier,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        }
    }

    /// Also deliver detections to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn EventNotifier>) -> Self {
        self.notifier.push(notifier);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ClassifierHandle {
        &self.classifier
    }

    /// Load the model and run its warm-up inference.
    ///
    /// Call once at startup, before `start()`.
    pub fn load_model<F>(&self, loader: F, labels: LabelTable) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn SoundModel>>,
    {
        self.set_status(EngineStatus::Loading, None);
        info!("loading sound model");
        match self.classifier.load(loader, labels) {
            Ok(()) => {
                self.set_status(EngineStatus::Idle, None);
                Ok(())
            }
            Err(e) => {
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Open a source with `factory` and start classifying on a dedicated
    /// worker thread.
    ///
    /// Blocks until the source is confirmed open and started (or fails).
    ///
    /// # Errors
    /// - `AlreadyRunning` if a session is active.
    /// - `ModelLoad` if no model is ready, `Config` if the configured window
    ///   disagrees with the model.
    /// - Whatever the factory or `start` reports (`PermissionDenied`,
    ///   `DeviceUnavailable`, ...), and `DeviceUnavailable` when the device's
    ///   minimum buffer exceeds the window.
    pub fn start<F>(&self, factory: F) -> Result<()>
    where
        F: FnOnce(CaptureFormat, SessionFlag) -> Result<Box<dyn AudioSource>> + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if let Some(current) = worker.as_ref() {
            if !current.handle.is_finished() {
                return Err(SoundwatchError::AlreadyRunning);
            }
        }
        // A previous session ended on its own; reap it.
        if let Some(finished) = worker.take() {
            if let Ok(Some(exit)) = finished.handle.join() {
                info!(?exit, "reaped finished capture session");
            }
        }

        let window_len = match (self.classifier.state(), self.classifier.input_len()) {
            (ClassifierState::Ready, Some(len)) => self.config.resolve_window_len(len)?,
            (state, _) => {
                return Err(SoundwatchError::ModelLoad(format!(
                    "cannot start capture: classifier is {state:?}"
                )))
            }
        };

        self.diagnostics.reset();
        let session = SessionFlag::new();
        let format = self.config.capture_format();

        let config = self.config.clone();
        let classifier = self.classifier.clone();
        let notifier: Arc<dyn EventNotifier> = Arc::new(self.notifier.clone());
        let diagnostics = Arc::clone(&self.diagnostics);
        let seq = Arc::clone(&self.seq);
        let status = Arc::clone(&self.status);
        let status_tx = self.status_tx.clone();
        let worker_session = session.clone();

        // Sync oneshot: the worker reports open/start success or failure.
        let (open_tx, open_rx) = mpsc::channel::<Result<()>>();

        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || {
                // ── Open the source (must happen on THIS thread) ──
                let source = match open_source(factory, format, worker_session.clone(), window_len)
                {
                    Ok(source) => {
                        publish_status(&status, &status_tx, EngineStatus::Listening, None);
                        let _ = open_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return None;
                    }
                };

                let exit = pipeline::run(pipeline::PipelineContext {
                    config,
                    classifier,
                    source,
                    window_len,
                    session: worker_session,
                    notifier,
                    diagnostics,
                    seq,
                });

                let (new_status, detail) = match &exit {
                    PipelineExit::Fatal(e) => (EngineStatus::Error, Some(e.to_string())),
                    PipelineExit::SourceExhausted => {
                        (EngineStatus::Stopped, Some("source exhausted".into()))
                    }
                    PipelineExit::Stopped => (EngineStatus::Stopped, None),
                };
                publish_status(&status, &status_tx, new_status, detail);
                Some(exit)
            })?;

        // Block start() until the device is confirmed open.
        match open_rx.recv() {
            Ok(Ok(())) => {
                *worker = Some(Worker { session, handle });
                info!(window_len, "engine started; listening");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent: the factory panicked.
                let _ = handle.join();
                self.set_status(EngineStatus::Error, Some("worker failed to start".into()));
                Err(SoundwatchError::Other(anyhow::anyhow!(
                    "capture worker died unexpectedly"
                )))
            }
        }
    }

    /// Cancel the session and wait for the worker to finish.
    ///
    /// # Errors
    /// `NotRunning` if no session exists.
    pub fn stop(&self) -> Result<PipelineExit> {
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or(SoundwatchError::NotRunning)?;
        info!("engine stop requested");
        worker.session.cancel();
        join_worker(worker)
    }

    /// Wait for a session that ends on its own (end of clip, fatal error).
    pub fn wait(&self) -> Result<PipelineExit> {
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or(SoundwatchError::NotRunning)?;
        join_worker(worker)
    }

    /// Stop any session and release the model. Process shutdown only: the
    /// classifier cannot be loaded again afterwards.
    pub fn shutdown(&self) -> Result<()> {
        match self.stop() {
            Ok(exit) => info!(?exit, "capture stopped for shutdown"),
            Err(SoundwatchError::NotRunning) => {}
            Err(e) => warn!(error = %e, "stopping capture during shutdown failed"),
        }
        match self.classifier.unload() {
            Ok(()) | Err(SoundwatchError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `true` while a capture session is active.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to detections.
    pub fn subscribe_detections(&self) -> broadcast::Receiver<DetectionEvent> {
        self.detection_tx.subscribe()
    }

    /// Snapshot of pipeline counters for the current or last session.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        publish_status(&self.status, &self.status_tx, new_status, detail);
    }
}

impl Drop for SoundwatchEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.session.cancel();
            let _ = worker.handle.join();
        }
    }
}

fn publish_status(
    status: &Mutex<EngineStatus>,
    status_tx: &broadcast::Sender<EngineStatusEvent>,
    new_status: EngineStatus,
    detail: Option<String>,
) {
    *status.lock() = new_status;
    let _ = status_tx.send(EngineStatusEvent {
        status: new_status,
        detail,
    });
}

/// Build, check and start a source. On failure the source is released
/// before returning.
fn open_source<F>(
    factory: F,
    format: CaptureFormat,
    session: SessionFlag,
    window_len: usize,
) -> Result<Box<dyn AudioSource>>
where
    F: FnOnce(CaptureFormat, SessionFlag) -> Result<Box<dyn AudioSource>>,
{
    format.validate()?;
    let mut source = factory(format, session)?;

    let checked = if source.min_buffer_len() > window_len {
        Err(SoundwatchError::DeviceUnavailable(format!(
            "device needs at least {} samples per read, window is {window_len}",
            source.min_buffer_len()
        )))
    } else {
        source.start()
    };

    match checked {
        Ok(()) => Ok(source),
        Err(e) => {
            source.release();
            Err(e)
        }
    }
}

fn join_worker(worker: Worker) -> Result<PipelineExit> {
    match worker.handle.join() {
        Ok(Some(exit)) => Ok(exit),
        Ok(None) => Err(SoundwatchError::NotRunning),
        Err(_) => Err(SoundwatchError::Other(anyhow::anyhow!(
            "capture worker panicked"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Instant;

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::audio::{ClipSource, SourceState};
    use crate::inference::stub::ThresholdModel;

    const WINDOW: usize = 4;

    fn loaded_engine(config: EngineConfig) -> SoundwatchEngine {
        let engine = SoundwatchEngine::new(config, ClassifierHandle::default());
        engine
            .load_model(
                || -> Result<Box<dyn SoundModel>> { Ok(Box::new(ThresholdModel::new(WINDOW, 0.5))) },
                LabelTable::siren_default(),
            )
            .expect("load threshold model");
        engine
    }

    fn clip(samples: Vec<f32>) -> impl FnOnce(CaptureFormat, SessionFlag) -> Result<Box<dyn AudioSource>> + Send + 'static {
        move |format, _session| Ok(Box::new(ClipSource::new(samples, format)) as Box<dyn AudioSource>)
    }

    /// Quiet windows until cancelled, like a live microphone.
    struct LiveSource {
        session: SessionFlag,
        state: SourceState,
        min_buffer_len: usize,
        released: Arc<Mutex<bool>>,
    }

    impl AudioSource for LiveSource {
        fn format(&self) -> CaptureFormat {
            CaptureFormat::default()
        }

        fn min_buffer_len(&self) -> usize {
            self.min_buffer_len
        }

        fn state(&self) -> SourceState {
            self.state
        }

        fn start(&mut self) -> Result<()> {
            self.state = SourceState::Started;
            Ok(())
        }

        fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
            if !self.session.is_active() {
                self.stop();
                return Ok(0);
            }
            thread::sleep(Duration::from_millis(2));
            buf.fill(0.0);
            Ok(buf.len())
        }

        fn stop(&mut self) {
            if self.state != SourceState::Released {
                self.state = SourceState::Stopped;
            }
        }

        fn release(&mut self) {
            self.state = SourceState::Released;
            *self.released.lock() = true;
        }
    }

    fn live(
        released: Arc<Mutex<bool>>,
        min_buffer_len: usize,
    ) -> impl FnOnce(CaptureFormat, SessionFlag) -> Result<Box<dyn AudioSource>> + Send + 'static {
        move |_format, session| {
            Ok(Box::new(LiveSource {
                session,
                state: SourceState::Opened,
                min_buffer_len,
                released,
            }) as Box<dyn AudioSource>)
        }
    }

    #[test]
    fn clip_session_reports_detection_and_exhausts() {
        let engine = loaded_engine(EngineConfig::default());
        let mut detections = engine.subscribe_detections();

        let mut samples = vec![0.0; WINDOW * 2];
        samples.extend(vec![1.0; WINDOW]);
        engine.start(clip(samples)).expect("start clip session");

        let exit = engine.wait().expect("join worker");
        assert!(matches!(exit, PipelineExit::SourceExhausted), "{exit:?}");
        assert_eq!(engine.status(), EngineStatus::Stopped);

        let event = detections.try_recv().expect("one detection");
        assert_eq!(event.label, "Siren");
        assert!(matches!(detections.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(engine.diagnostics_snapshot().windows_read, 3);
    }

    #[test]
    fn start_without_model_is_model_load_error() {
        let engine = SoundwatchEngine::new(EngineConfig::default(), ClassifierHandle::default());
        assert!(matches!(
            engine.start(clip(vec![0.0; WINDOW])),
            Err(SoundwatchError::ModelLoad(_))
        ));
    }

    #[test]
    fn configured_window_must_match_model() {
        let engine = loaded_engine(EngineConfig {
            window_len: Some(WINDOW * 2),
            ..EngineConfig::default()
        });
        assert!(matches!(
            engine.start(clip(vec![0.0; WINDOW])),
            Err(SoundwatchError::Config(_))
        ));
    }

    #[test]
    fn open_failure_surfaces_from_start() {
        let engine = loaded_engine(EngineConfig::default());
        let err = engine
            .start(|_, _| Err(SoundwatchError::PermissionDenied("microphone blocked".into())))
            .unwrap_err();
        assert!(matches!(err, SoundwatchError::PermissionDenied(_)));
        assert_eq!(engine.status(), EngineStatus::Error);
        assert!(!engine.is_running());
    }

    #[test]
    fn oversized_device_buffer_is_rejected_and_released() {
        let engine = loaded_engine(EngineConfig::default());
        let released = Arc::new(Mutex::new(false));
        let err = engine
            .start(live(Arc::clone(&released), WINDOW * 4))
            .unwrap_err();
        assert!(matches!(err, SoundwatchError::DeviceUnavailable(_)));
        assert!(*released.lock());
    }

    #[test]
    fn stop_ends_session_within_read_timeout() {
        let config = EngineConfig::default();
        let read_timeout = config.read_timeout;
        let engine = loaded_engine(config);
        let released = Arc::new(Mutex::new(false));
        engine.start(live(Arc::clone(&released), 0)).unwrap();
        assert!(engine.is_running());
        assert!(matches!(
            engine.start(live(Arc::new(Mutex::new(false)), 0)),
            Err(SoundwatchError::AlreadyRunning)
        ));

        thread::sleep(Duration::from_millis(20));
        let stop_requested = Instant::now();
        let exit = engine.stop().expect("stop");
        assert!(stop_requested.elapsed() < read_timeout);
        assert!(matches!(exit, PipelineExit::Stopped), "{exit:?}");
        assert!(*released.lock());
        assert_eq!(engine.status(), EngineStatus::Stopped);
        assert!(matches!(engine.stop(), Err(SoundwatchError::NotRunning)));
    }

    #[test]
    fn engine_can_restart_after_stop() {
        let engine = loaded_engine(EngineConfig::default());
        for _ in 0..2 {
            engine.start(live(Arc::new(Mutex::new(false)), 0)).unwrap();
            engine.stop().unwrap();
        }
    }

    #[test]
    fn shutdown_unloads_classifier() {
        let engine = loaded_engine(EngineConfig::default());
        engine.start(live(Arc::new(Mutex::new(false)), 0)).unwrap();
        engine.shutdown().unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.classifier().state(), ClassifierState::Closed);
        engine.shutdown().unwrap();
    }

    #[test]
    fn failed_load_sets_error_status() {
        let engine = SoundwatchEngine::new(EngineConfig::default(), ClassifierHandle::default());
        let mut status = engine.subscribe_status();
        let err = engine
            .load_model(
                || Err(SoundwatchError::ModelLoad("truncated graph".into())),
                LabelTable::siren_default(),
            )
            .unwrap_err();
        assert!(matches!(err, SoundwatchError::ModelLoad(_)));
        assert_eq!(engine.status(), EngineStatus::Error);
        assert_eq!(status.try_recv().unwrap().status, EngineStatus::Loading);
        assert_eq!(status.try_recv().unwrap().status, EngineStatus::Error);
    }
}
