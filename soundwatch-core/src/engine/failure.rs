//! Consecutive-failure policy for the worker loop.

use tracing::{error, warn};

use crate::error::{ErrorClass, SoundwatchError};

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// What the loop should do after an iteration failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry,
    GiveUp,
}

/// Counts consecutive failed iterations. Transient errors are retried until
/// `max_consecutive` failures in a row; fatal and contract errors end the
/// loop at once. Any successful iteration resets the count.
#[derive(Debug)]
pub struct FailureTracker {
    max_consecutive: u32,
    consecutive: u32,
}

impl FailureTracker {
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            max_consecutive: max_consecutive.max(1),
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self, err: &SoundwatchError) -> FailureAction {
        self.consecutive = self.consecutive.saturating_add(1);
        match err.class() {
            ErrorClass::Transient if self.consecutive < self.max_consecutive => {
                warn!(
                    error = %err,
                    attempt = self.consecutive,
                    max = self.max_consecutive,
                    "transient failure; retrying"
                );
                FailureAction::Retry
            }
            ErrorClass::Transient => {
                error!(
                    error = %err,
                    consecutive = self.consecutive,
                    "too many consecutive failures"
                );
                FailureAction::GiveUp
            }
            ErrorClass::Fatal | ErrorClass::Contract => {
                error!(error = %err, "unrecoverable failure");
                FailureAction::GiveUp
            }
        }
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }
}
