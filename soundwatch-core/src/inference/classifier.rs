//! Model lifecycle and window classification.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::buffering::buffer::AudioBuffer;
use crate::error::{Result, SoundwatchError};
use crate::inference::{LabelTable, SoundModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierState {
    Uninitialized,
    Loading,
    Ready,
    Closed,
    Failed,
}

/// Outcome of classifying one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Classification {
    /// A target label: worth a notification.
    Event { label: String, index: usize, score: f32 },
    /// A label the table marks as background.
    NoEvent { label: String, index: usize, score: f32 },
    /// The winning index has no entry in the label table.
    Unknown { index: usize, score: f32 },
}

impl Classification {
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Event { label, .. } | Self::NoEvent { label, .. } => Some(label),
            Self::Unknown { .. } => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Event { index, .. } | Self::NoEvent { index, .. } | Self::Unknown { index, .. } => {
                *index
            }
        }
    }

    pub fn score(&self) -> f32 {
        match self {
            Self::Event { score, .. } | Self::NoEvent { score, .. } | Self::Unknown { score, .. } => {
                *score
            }
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Self::Event { .. })
    }
}

struct LoadedModel {
    backend: Box<dyn SoundModel>,
    labels: LabelTable,
}

/// Owns at most one loaded model and moves it through
/// `Uninitialized → Loading → Ready → Closed` (`Failed` after a bad load).
pub struct Classifier {
    state: ClassifierState,
    model: Option<LoadedModel>,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            state: ClassifierState::Uninitialized,
            model: None,
        }
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    /// Samples per window expected by the loaded model.
    pub fn input_len(&self) -> Option<usize> {
        self.model.as_ref().map(|m| m.backend.input_len())
    }

    pub fn labels(&self) -> Option<&LabelTable> {
        self.model.as_ref().map(|m| &m.labels)
    }

    /// Build a backend with `loader` and make it ready for inference.
    ///
    /// A zero window is pushed through the backend before the classifier
    /// becomes `Ready`, so a graph that cannot run fails here rather than on
    /// the first captured window.
    ///
    /// # Errors
    /// - `AlreadyLoaded` when a model is ready, `AlreadyClosed` after unload.
    /// - Whatever `loader` returns, or `ModelLoad` when warm-up fails; the
    ///   classifier is then `Failed` and may be loaded again.
    pub fn load<F>(&mut self, loader: F, labels: LabelTable) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn SoundModel>>,
    {
        match self.state {
            ClassifierState::Uninitialized | ClassifierState::Failed => {}
            ClassifierState::Ready | ClassifierState::Loading => {
                return Err(SoundwatchError::AlreadyLoaded)
            }
            ClassifierState::Closed => return Err(SoundwatchError::AlreadyClosed),
        }

        self.state = ClassifierState::Loading;
        match Self::prepare(loader, &labels) {
            Ok(backend) => {
                info!(
                    input_len = backend.input_len(),
                    classes = labels.len(),
                    "classifier ready"
                );
                self.model = Some(LoadedModel { backend, labels });
                self.state = ClassifierState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "model load failed");
                self.state = ClassifierState::Failed;
                Err(e)
            }
        }
    }

    fn prepare<F>(loader: F, labels: &LabelTable) -> Result<Box<dyn SoundModel>>
    where
        F: FnOnce() -> Result<Box<dyn SoundModel>>,
    {
        let mut backend = loader()?;
        let input_len = backend.input_len();
        if input_len == 0 {
            return Err(SoundwatchError::ModelLoad(
                "model reports a zero-length input".into(),
            ));
        }

        let warm = backend
            .scores(&vec![0.0; input_len])
            .map_err(|e| SoundwatchError::ModelLoad(format!("warm-up inference failed: {e}")))?;
        if warm.is_empty() {
            return Err(SoundwatchError::ModelLoad(
                "warm-up inference produced no scores".into(),
            ));
        }
        if warm.len() != labels.len() {
            warn!(
                outputs = warm.len(),
                labels = labels.len(),
                "model output count differs from label table; unmatched indices classify as unknown"
            );
        }
        Ok(backend)
    }

    /// Classify one window.
    ///
    /// # Errors
    /// - `AlreadyClosed` after unload.
    /// - `Inference` when no model is ready, the window length differs from
    ///   the model input, or the backend fails.
    pub fn classify(&mut self, buffer: &AudioBuffer) -> Result<Classification> {
        let model = match (self.state, self.model.as_mut()) {
            (ClassifierState::Ready, Some(model)) => model,
            (ClassifierState::Closed, _) => return Err(SoundwatchError::AlreadyClosed),
            _ => {
                return Err(SoundwatchError::Inference(
                    "classifier not ready".into(),
                ))
            }
        };

        let expected = model.backend.input_len();
        if buffer.len() != expected {
            return Err(SoundwatchError::Inference(format!(
                "buffer has {} samples, model expects {expected}",
                buffer.len()
            )));
        }

        let scores = model.backend.scores(buffer.samples())?;
        if let Some(bad) = scores.iter().position(|s| !s.is_finite()) {
            return Err(SoundwatchError::Inference(format!(
                "model produced a non-finite score at index {bad}"
            )));
        }
        let (index, score) = argmax(&scores)
            .ok_or_else(|| SoundwatchError::Inference("model produced no scores".into()))?;

        let result = match model.labels.get(index) {
            Some(label) if model.labels.is_background(label) => Classification::NoEvent {
                label: label.to_string(),
                index,
                score,
            },
            Some(label) => Classification::Event {
                label: label.to_string(),
                index,
                score,
            },
            None => Classification::Unknown { index, score },
        };
        debug!(?result, "classified window");
        Ok(result)
    }

    /// Release the model. Allowed once.
    pub fn unload(&mut self) -> Result<()> {
        if self.state == ClassifierState::Closed {
            return Err(SoundwatchError::AlreadyClosed);
        }
        let had_model = self.model.take().is_some();
        self.state = ClassifierState::Closed;
        info!(had_model, "classifier unloaded");
        Ok(())
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Index and value of the largest score; on ties the lowest index wins.
/// Callers reject non-finite scores first.
fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (index, score)| match best {
            Some((_, top)) if score <= top => best,
            _ => Some((index, score)),
        })
}

/// Shared, serialised access to a [`Classifier`].
#[derive(Clone, Default)]
pub struct ClassifierHandle(pub Arc<Mutex<Classifier>>);

impl ClassifierHandle {
    pub fn new(classifier: Classifier) -> Self {
        Self(Arc::new(Mutex::new(classifier)))
    }

    pub fn load<F>(&self, loader: F, labels: LabelTable) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn SoundModel>>,
    {
        self.0.lock().load(loader, labels)
    }

    pub fn classify(&self, buffer: &AudioBuffer) -> Result<Classification> {
        self.0.lock().classify(buffer)
    }

    pub fn unload(&self) -> Result<()> {
        self.0.lock().unload()
    }

    pub fn state(&self) -> ClassifierState {
        self.0.lock().state()
    }

    pub fn input_len(&self) -> Option<usize> {
        self.0.lock().input_len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::inference::stub::ThresholdModel;

    const WINDOW: usize = 8;

    fn threshold_loader() -> Result<Box<dyn SoundModel>> {
        Ok(Box::new(ThresholdModel::new(WINDOW, 0.5)))
    }

    fn ready() -> Classifier {
        let mut classifier = Classifier::new();
        classifier
            .load(threshold_loader, LabelTable::siren_default())
            .expect("load stub");
        classifier
    }

    struct FixedScores(Vec<f32>);

    impl SoundModel for FixedScores {
        fn input_len(&self) -> usize {
            WINDOW
        }

        fn scores(&mut self, _window: &[f32]) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn load_then_unload_returns_live_count_to_baseline() {
        let live = Arc::new(AtomicUsize::new(0));
        let mut classifier = Classifier::new();
        let counter = Arc::clone(&live);
        classifier
            .load(
                move || Ok(Box::new(ThresholdModel::tracked(WINDOW, 0.5, counter))),
                LabelTable::siren_default(),
            )
            .unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(classifier.state(), ClassifierState::Ready);

        classifier.unload().unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(classifier.state(), ClassifierState::Closed);
    }

    #[test]
    fn unload_twice_is_already_closed() {
        let mut classifier = ready();
        classifier.unload().unwrap();
        assert!(matches!(classifier.unload(), Err(SoundwatchError::AlreadyClosed)));
        let buffer = AudioBuffer::zeroed(WINDOW, 16_000);
        assert!(matches!(
            classifier.classify(&buffer),
            Err(SoundwatchError::AlreadyClosed)
        ));
        assert!(matches!(
            classifier.load(threshold_loader, LabelTable::siren_default()),
            Err(SoundwatchError::AlreadyClosed)
        ));
    }

    #[test]
    fn second_load_is_already_loaded() {
        let mut classifier = ready();
        assert!(matches!(
            classifier.load(threshold_loader, LabelTable::siren_default()),
            Err(SoundwatchError::AlreadyLoaded)
        ));
    }

    #[test]
    fn failed_load_can_be_retried() {
        let mut classifier = Classifier::new();
        let err = classifier
            .load(
                || Err(SoundwatchError::ModelLoad("corrupt graph".into())),
                LabelTable::siren_default(),
            )
            .unwrap_err();
        assert!(matches!(err, SoundwatchError::ModelLoad(_)));
        assert_eq!(classifier.state(), ClassifierState::Failed);

        classifier
            .load(threshold_loader, LabelTable::siren_default())
            .unwrap();
        assert_eq!(classifier.state(), ClassifierState::Ready);
    }

    #[test]
    fn classify_before_load_is_not_ready() {
        let mut classifier = Classifier::new();
        let buffer = AudioBuffer::zeroed(WINDOW, 16_000);
        assert!(matches!(
            classifier.classify(&buffer),
            Err(SoundwatchError::Inference(_))
        ));
    }

    #[test]
    fn mismatched_buffer_length_is_inference_error() {
        let mut classifier = ready();
        for len in [0, WINDOW - 1, WINDOW + 1] {
            let buffer = AudioBuffer::zeroed(len, 16_000);
            assert!(matches!(
                classifier.classify(&buffer),
                Err(SoundwatchError::Inference(_))
            ));
        }
    }

    #[test]
    fn zero_window_classifies_identically_every_time() {
        let mut classifier = ready();
        let buffer = AudioBuffer::zeroed(WINDOW, 16_000);
        let first = classifier.classify(&buffer).unwrap();
        assert_eq!(first.label(), Some("Background"));
        assert!(!first.is_event());
        for _ in 0..10 {
            assert_eq!(classifier.classify(&buffer).unwrap(), first);
        }
    }

    #[test]
    fn loud_window_is_event() {
        let mut classifier = ready();
        let buffer = AudioBuffer::from_samples(vec![1.0; WINDOW], 16_000);
        let result = classifier.classify(&buffer).unwrap();
        assert!(result.is_event());
        assert_eq!(result.label(), Some("Siren"));
        assert_eq!(result.index(), 1);
    }

    #[test]
    fn index_outside_label_table_is_unknown() {
        let mut classifier = Classifier::new();
        classifier
            .load(
                || Ok(Box::new(FixedScores(vec![0.1, 0.2, 0.9]))),
                LabelTable::siren_default(),
            )
            .unwrap();
        let result = classifier
            .classify(&AudioBuffer::zeroed(WINDOW, 16_000))
            .unwrap();
        assert!(matches!(result, Classification::Unknown { index: 2, .. }));
        assert_eq!(result.label(), None);
    }

    #[test]
    fn empty_scores_fail_warm_up() {
        let mut classifier = Classifier::new();
        let err = classifier
            .load(|| Ok(Box::new(FixedScores(vec![]))), LabelTable::siren_default())
            .unwrap_err();
        assert!(matches!(err, SoundwatchError::ModelLoad(_)));
    }

    #[test]
    fn argmax_keeps_the_first_of_equal_scores() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some((1, 0.7)));
        assert_eq!(argmax(&[0.5, 0.5]), Some((0, 0.5)));
        assert_eq!(argmax(&[0.2, 0.4, 0.4, 0.1]), Some((1, 0.4)));
        assert_eq!(argmax(&[]), None);
    }

    fn fixed(scores: Vec<f32>) -> Classifier {
        let mut classifier = Classifier::new();
        classifier
            .load(
                move || Ok(Box::new(FixedScores(scores))),
                LabelTable::siren_default(),
            )
            .unwrap();
        classifier
    }

    #[test]
    fn tied_scores_resolve_to_background() {
        let result = fixed(vec![0.5, 0.5])
            .classify(&AudioBuffer::zeroed(WINDOW, 16_000))
            .unwrap();
        assert!(!result.is_event());
        assert_eq!(result.label(), Some("Background"));
    }

    #[test]
    fn non_finite_scores_are_inference_errors() {
        for scores in [
            vec![f32::NAN, f32::NAN],
            vec![0.9, f32::NAN],
            vec![0.1, f32::INFINITY],
        ] {
            let err = fixed(scores)
                .classify(&AudioBuffer::zeroed(WINDOW, 16_000))
                .unwrap_err();
            assert!(matches!(err, SoundwatchError::Inference(_)));
            assert!(err.is_transient());
        }
    }

    #[test]
    fn handle_serialises_access() {
        let handle = ClassifierHandle::default();
        handle
            .load(threshold_loader, LabelTable::siren_default())
            .unwrap();
        assert_eq!(handle.input_len(), Some(WINDOW));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    let buffer = AudioBuffer::zeroed(WINDOW, 16_000);
                    (0..25).all(|_| handle.classify(&buffer).is_ok())
                })
            })
            .collect();
        for worker in workers {
            assert!(worker.join().unwrap());
        }
    }
}
