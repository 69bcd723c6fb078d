//! Blocking worker loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Check the session flag; stop when cancelled or the source has stopped
//! 2. Blocking read of one full window into a reused buffer
//!    (short reads are discarded, never padded)
//! 3. Optional silence gate → skip inference for quiet windows
//! 4. Classify → Event | NoEvent | Unknown
//! 5. Event → DetectionEvent → EventNotifier (subject to cooldown)
//! 6. Feed the outcome to the FailureTracker
//! ```
//!
//! In `PipelineMode::Pipelined` stages 1-2 stay on the calling thread (the
//! source is `!Send`) and stages 3-6 move to a scoped classification thread.
//! The two are joined by a bounded queue; read errors travel through the same
//! queue so one tracker sees every outcome in capture order.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    audio::{level::SilenceGate, AudioSource, CaptureGuard, SourceState},
    buffering::buffer::AudioBuffer,
    engine::{
        failure::{FailureAction, FailureTracker},
        EngineConfig, PipelineMode,
    },
    error::{Result, SoundwatchError},
    inference::{Classification, ClassifierHandle},
    ipc::events::DetectionEvent,
    notify::EventNotifier,
    session::SessionFlag,
};

/// Progress is logged at `debug` every this many full windows.
const LOG_EVERY_WINDOWS: usize = 100;

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub windows_read: AtomicUsize,
    pub short_reads: AtomicUsize,
    pub windows_gated: AtomicUsize,
    pub inference_calls: AtomicUsize,
    pub inference_errors: AtomicUsize,
    pub read_errors: AtomicUsize,
    pub events_detected: AtomicUsize,
    pub notifications_sent: AtomicUsize,
    pub notifications_suppressed: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            windows_read: self.windows_read.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            windows_gated: self.windows_gated.load(Ordering::Relaxed),
            inference_calls: self.inference_calls.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            events_detected: self.events_detected.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_suppressed: self.notifications_suppressed.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 9] {
        [
            &self.windows_read,
            &self.short_reads,
            &self.windows_gated,
            &self.inference_calls,
            &self.inference_errors,
            &self.read_errors,
            &self.events_detected,
            &self.notifications_sent,
            &self.notifications_suppressed,
        ]
    }

    fn note_window_read(&self) {
        let windows = self.windows_read.fetch_add(1, Ordering::Relaxed) + 1;
        if windows % LOG_EVERY_WINDOWS == 0 {
            debug!(windows, snapshot = ?self.snapshot(), "pipeline progress");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub windows_read: usize,
    pub short_reads: usize,
    pub windows_gated: usize,
    pub inference_calls: usize,
    pub inference_errors: usize,
    pub read_errors: usize,
    pub events_detected: usize,
    pub notifications_sent: usize,
    pub notifications_suppressed: usize,
}

/// All context the pipeline needs, passed as one struct so the worker
/// closure stays tidy.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub classifier: ClassifierHandle,
    /// A started source. It is stopped and released before `run` returns.
    pub source: Box<dyn AudioSource>,
    /// Samples per window; equals the model input length.
    pub window_len: usize,
    pub session: SessionFlag,
    pub notifier: Arc<dyn EventNotifier>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub seq: Arc<AtomicU64>,
}

/// Why the worker loop ended.
#[derive(Debug)]
pub enum PipelineExit {
    /// The session flag was cleared.
    Stopped,
    /// The source stopped on its own, e.g. the end of a clip.
    SourceExhausted,
    /// A fatal error, or too many consecutive transient ones.
    Fatal(SoundwatchError),
}

impl PipelineExit {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Fatal(e) => Err(e),
            Self::Stopped | Self::SourceExhausted => Ok(()),
        }
    }
}

/// Stages 3-5 of one iteration.
struct WindowHandler {
    classifier: ClassifierHandle,
    notifier: Arc<dyn EventNotifier>,
    gate: Option<SilenceGate>,
    cooldown: Option<Duration>,
    last_notified: Option<(String, Instant)>,
    diagnostics: Arc<PipelineDiagnostics>,
    seq: Arc<AtomicU64>,
}

impl WindowHandler {
    fn handle(&mut self, buffer: &AudioBuffer) -> Result<()> {
        if let Some(gate) = &self.gate {
            if gate.is_silent(buffer.samples()) {
                self.diagnostics.windows_gated.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        self.diagnostics
            .inference_calls
            .fetch_add(1, Ordering::Relaxed);
        let result = match self.classifier.classify(buffer) {
            Ok(result) => result,
            Err(e) => {
                self.diagnostics
                    .inference_errors
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if let Classification::Event {
            label,
            index,
            score,
        } = result
        {
            self.report(label, index, score);
        }
        Ok(())
    }

    fn report(&mut self, label: String, index: usize, score: f32) {
        self.diagnostics
            .events_detected
            .fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        if let (Some(cooldown), Some((last_label, at))) = (self.cooldown, &self.last_notified) {
            if *last_label == label && now.duration_since(*at) < cooldown {
                self.diagnostics
                    .notifications_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(%label, "detection within cooldown; not notifying");
                return;
            }
        }

        let event = DetectionEvent::new(
            self.seq.fetch_add(1, Ordering::Relaxed),
            label.clone(),
            index,
            score,
        );
        self.notifier.notify(&event);
        self.diagnostics
            .notifications_sent
            .fetch_add(1, Ordering::Relaxed);
        self.last_notified = Some((label, now));
    }
}

/// Run the worker loop until the session is cancelled, the source stops, or
/// a failure ends it.
pub fn run(ctx: PipelineContext) -> PipelineExit {
    let PipelineContext {
        config,
        classifier,
        mut source,
        window_len,
        session,
        notifier,
        diagnostics,
        seq,
    } = ctx;

    let mut guard = CaptureGuard::new(source.as_mut());
    let sample_rate = guard.format().sample_rate;
    info!(window_len, sample_rate, mode = ?config.mode, "pipeline started");

    let mut handler = WindowHandler {
        classifier,
        notifier,
        gate: config.silence_floor_rms.map(SilenceGate::new),
        cooldown: config.notify_cooldown,
        last_notified: None,
        diagnostics: Arc::clone(&diagnostics),
        seq,
    };
    let mut tracker = FailureTracker::new(config.max_consecutive_failures);
    let shape = WindowShape {
        len: window_len,
        sample_rate,
    };

    let exit = match config.mode {
        PipelineMode::Sequential => run_sequential(
            &mut *guard,
            &mut handler,
            &mut tracker,
            &session,
            shape,
            &diagnostics,
        ),
        PipelineMode::Pipelined { depth } => run_pipelined(
            &mut *guard,
            handler,
            tracker,
            &session,
            shape,
            &diagnostics,
            depth,
        ),
    };

    drop(guard);
    info!(?exit, snapshot = ?diagnostics.snapshot(), "pipeline finished");
    exit
}

#[derive(Debug, Clone, Copy)]
struct WindowShape {
    len: usize,
    sample_rate: u32,
}

fn source_finished(source: &dyn AudioSource) -> bool {
    matches!(
        source.state(),
        SourceState::Stopped | SourceState::Released
    )
}

fn run_sequential(
    source: &mut dyn AudioSource,
    handler: &mut WindowHandler,
    tracker: &mut FailureTracker,
    session: &SessionFlag,
    shape: WindowShape,
    diagnostics: &PipelineDiagnostics,
) -> PipelineExit {
    let mut buffer = AudioBuffer::zeroed(shape.len, shape.sample_rate);

    loop {
        if !session.is_active() {
            return PipelineExit::Stopped;
        }
        if source_finished(source) {
            return PipelineExit::SourceExhausted;
        }

        let outcome = match source.read(buffer.samples_mut()) {
            Ok(n) if n == shape.len => {
                diagnostics.note_window_read();
                handler.handle(&buffer)
            }
            Ok(n) => {
                diagnostics.short_reads.fetch_add(1, Ordering::Relaxed);
                debug!(samples = n, "discarding short read");
                continue;
            }
            Err(e) => {
                diagnostics.read_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        };

        match outcome {
            Ok(()) => tracker.record_success(),
            Err(e) => {
                if tracker.record_failure(&e) == FailureAction::GiveUp {
                    return PipelineExit::Fatal(e);
                }
            }
        }
    }
}

/// One item on the capture → classification queue.
enum Captured {
    Window(AudioBuffer),
    ReadFailed(SoundwatchError),
}

enum CaptureEnd {
    Cancelled,
    Exhausted,
    Halted,
}

fn run_pipelined(
    source: &mut dyn AudioSource,
    handler: WindowHandler,
    tracker: FailureTracker,
    session: &SessionFlag,
    shape: WindowShape,
    diagnostics: &PipelineDiagnostics,
    depth: usize,
) -> PipelineExit {
    let depth = depth.clamp(1, 2);
    // One buffer being filled, `depth` queued, one being classified.
    let pool = depth + 2;
    let (work_tx, work_rx) = bounded::<Captured>(depth);
    let (free_tx, free_rx) = bounded::<AudioBuffer>(pool);
    for _ in 0..pool {
        if free_tx
            .send(AudioBuffer::zeroed(shape.len, shape.sample_rate))
            .is_err()
        {
            break;
        }
    }

    // Cleared by the classification side to ask capture to wind down.
    let halt = SessionFlag::new();

    std::thread::scope(|scope| {
        let classification = {
            let session = session.clone();
            let halt = halt.clone();
            scope.spawn(move || classify_stage(work_rx, free_tx, handler, tracker, session, halt))
        };

        let end = capture_stage(source, work_tx, free_rx, session, &halt, shape, diagnostics);

        let verdict = classification.join().unwrap_or_else(|_| {
            Some(SoundwatchError::Other(anyhow::anyhow!(
                "classification thread panicked"
            )))
        });

        match (verdict, end) {
            (Some(e), _) => PipelineExit::Fatal(e),
            (None, CaptureEnd::Exhausted) => PipelineExit::SourceExhausted,
            (None, CaptureEnd::Cancelled | CaptureEnd::Halted) => PipelineExit::Stopped,
        }
    })
}

fn capture_stage(
    source: &mut dyn AudioSource,
    work_tx: Sender<Captured>,
    free_rx: Receiver<AudioBuffer>,
    session: &SessionFlag,
    halt: &SessionFlag,
    shape: WindowShape,
    diagnostics: &PipelineDiagnostics,
) -> CaptureEnd {
    let mut spare: Option<AudioBuffer> = None;

    loop {
        if !session.is_active() {
            return CaptureEnd::Cancelled;
        }
        if !halt.is_active() {
            return CaptureEnd::Halted;
        }
        if source_finished(source) {
            return CaptureEnd::Exhausted;
        }

        // Blocks while every buffer is queued or in use: backpressure.
        let mut buffer = match spare.take() {
            Some(buffer) => buffer,
            None => match free_rx.recv() {
                Ok(buffer) => buffer,
                Err(_) => return CaptureEnd::Halted,
            },
        };

        let item = match source.read(buffer.samples_mut()) {
            Ok(n) if n == shape.len => {
                diagnostics.note_window_read();
                Captured::Window(buffer)
            }
            Ok(n) => {
                diagnostics.short_reads.fetch_add(1, Ordering::Relaxed);
                debug!(samples = n, "discarding short read");
                spare = Some(buffer);
                continue;
            }
            Err(e) => {
                diagnostics.read_errors.fetch_add(1, Ordering::Relaxed);
                spare = Some(buffer);
                Captured::ReadFailed(e)
            }
        };

        if work_tx.send(item).is_err() {
            return CaptureEnd::Halted;
        }
    }
}

fn classify_stage(
    work_rx: Receiver<Captured>,
    free_tx: Sender<AudioBuffer>,
    mut handler: WindowHandler,
    mut tracker: FailureTracker,
    session: SessionFlag,
    halt: SessionFlag,
) -> Option<SoundwatchError> {
    for item in work_rx.iter() {
        if !session.is_active() {
            // Cancelled: hand queued buffers back without classifying them.
            if let Captured::Window(buffer) = item {
                let _ = free_tx.send(buffer);
            }
            continue;
        }

        let outcome = match item {
            Captured::Window(buffer) => {
                let outcome = handler.handle(&buffer);
                let _ = free_tx.send(buffer);
                outcome
            }
            Captured::ReadFailed(e) => Err(e),
        };

        match outcome {
            Ok(()) => tracker.record_success(),
            Err(e) => {
                if tracker.record_failure(&e) == FailureAction::GiveUp {
                    halt.cancel();
                    return Some(e);
                }
            }
        }
    }

    None
}
