//! Cooperative cancellation shared between the controller and the worker.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Recording-active flag.
///
/// The controller holds one clone and calls [`SessionFlag::cancel`]; the
/// worker loop and the audio source hold others and poll
/// [`SessionFlag::is_active`] without blocking.
#[derive(Debug, Clone)]
pub struct SessionFlag(Arc<AtomicBool>);

impl SessionFlag {
    /// A new, active session.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Mark the session inactive. Idempotent.
    pub fn cancel(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for SessionFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_visible_through_clones() {
        let flag = SessionFlag::new();
        let worker_view = flag.clone();
        assert!(worker_view.is_active());
        flag.cancel();
        assert!(!worker_view.is_active());
        flag.cancel();
        assert!(!flag.is_active());
    }
}
