//! Event notifiers: where detections go.
//!
//! `notify` is called on the classification thread for every reported
//! detection, so implementations must return quickly. Anything slow (process
//! spawns, network calls) belongs on another thread.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, trace};

use crate::ipc::events::DetectionEvent;

/// Fire-and-forget sink for detections.
pub trait EventNotifier: Send + Sync {
    fn notify(&self, event: &DetectionEvent);
}

impl<F> EventNotifier for F
where
    F: Fn(&DetectionEvent) + Send + Sync,
{
    fn notify(&self, event: &DetectionEvent) {
        self(event)
    }
}

/// Logs every detection at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl EventNotifier for LogNotifier {
    fn notify(&self, event: &DetectionEvent) {
        info!(
            seq = event.seq,
            label = %event.label,
            score = format_args!("{:.3}", event.score),
            "{}",
            event.message()
        );
    }
}

/// Publishes detections on a tokio broadcast channel.
///
/// Sending never blocks; with no subscribers the event is dropped, and slow
/// subscribers observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<DetectionEvent>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<DetectionEvent>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.tx.subscribe()
    }
}

impl EventNotifier for BroadcastNotifier {
    fn notify(&self, event: &DetectionEvent) {
        if self.tx.send(event.clone()).is_err() {
            trace!(seq = event.seq, "no detection subscribers");
        }
    }
}

/// Forwards each detection to every inner notifier, in order.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn EventNotifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: Arc<dyn EventNotifier>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn push(&mut self, target: Arc<dyn EventNotifier>) {
        self.targets.push(target);
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl EventNotifier for FanoutNotifier {
    fn notify(&self, event: &DetectionEvent) {
        for target in &self.targets {
            target.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn closures_are_notifiers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let notifier = move |event: &DetectionEvent| sink.lock().push(event.label.clone());

        notifier.notify(&DetectionEvent::new(0, "Siren", 1, 1.0));
        assert_eq!(&*seen.lock(), &["Siren".to_string()]);
    }

    #[test]
    fn broadcast_reaches_subscribers_and_tolerates_none() {
        let (tx, _) = broadcast::channel(4);
        let notifier = BroadcastNotifier::new(tx);
        notifier.notify(&DetectionEvent::new(0, "Siren", 1, 1.0));

        let mut rx = notifier.subscribe();
        notifier.notify(&DetectionEvent::new(1, "Siren", 1, 1.0));
        assert_eq!(rx.try_recv().expect("event").seq, 1);
    }

    #[test]
    fn fanout_calls_every_target() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = |calls: Arc<AtomicUsize>| -> Arc<dyn EventNotifier> {
            Arc::new(move |_: &DetectionEvent| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let fanout = FanoutNotifier::new()
            .with(counter(Arc::clone(&calls)))
            .with(counter(Arc::clone(&calls)))
            .with(Arc::new(LogNotifier));
        assert_eq!(fanout.len(), 3);

        fanout.notify(&DetectionEvent::new(0, "Siren", 1, 1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
