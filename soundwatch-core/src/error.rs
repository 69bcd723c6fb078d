use thiserror::Error;

/// All errors produced by soundwatch-core.
#[derive(Debug, Error)]
pub enum SoundwatchError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio read failed: {0}")]
    IoFailure(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("resource already closed")]
    AlreadyClosed,

    #[error("audio source already started")]
    AlreadyStarted,

    #[error("a model is already loaded")]
    AlreadyLoaded,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV decode error: {0}")]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How the worker loop should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Momentary device or inference hiccup; retried until the consecutive
    /// failure limit is reached.
    Transient,
    /// The session cannot continue (permission, unusable model, ...).
    Fatal,
    /// Caller broke an API contract. Reported immediately, never retried.
    Contract,
}

impl SoundwatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DeviceUnavailable(_) | Self::IoFailure(_) | Self::Inference(_) => {
                ErrorClass::Transient
            }
            Self::AlreadyClosed
            | Self::AlreadyStarted
            | Self::AlreadyLoaded
            | Self::AlreadyRunning
            | Self::NotRunning => ErrorClass::Contract,
            Self::PermissionDenied(_)
            | Self::ModelLoad(_)
            | Self::ModelNotFound { .. }
            | Self::Config(_)
            | Self::Io(_)
            | Self::Wav(_)
            | Self::Other(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, SoundwatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_and_inference_errors_are_transient() {
        assert!(SoundwatchError::IoFailure("overrun".into()).is_transient());
        assert!(SoundwatchError::DeviceUnavailable("busy".into()).is_transient());
        assert!(SoundwatchError::Inference("bad shape".into()).is_transient());
    }

    #[test]
    fn permission_and_model_errors_are_fatal() {
        assert_eq!(
            SoundwatchError::PermissionDenied("mic".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SoundwatchError::ModelLoad("corrupt".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn lifecycle_violations_are_contract_errors() {
        assert_eq!(SoundwatchError::AlreadyClosed.class(), ErrorClass::Contract);
        assert_eq!(SoundwatchError::AlreadyStarted.class(), ErrorClass::Contract);
    }
}
