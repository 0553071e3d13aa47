use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the remote interaction surface.
///
/// The surface decides the class: an element that is not there yet or not
/// clickable yet is transient, a dead browser connection is permanent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InteractionError {
    #[error("transient interaction failure: {0}")]
    Transient(String),

    #[error("permanent interaction failure: {0}")]
    Permanent(String),
}

impl InteractionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

#[derive(Error, Debug)]
pub enum PpmiError {
    #[error("Transient interaction failure: {0}")]
    TransientInteraction(String),

    #[error("Permanent failure: {0}")]
    PermanentFailure(String),

    #[error("Action '{action}' failed after {attempts} attempt(s): {last_error}")]
    RetryBudgetExceeded {
        action: String,
        attempts: u32,
        last_error: String,
        diagnostic: Option<PathBuf>,
    },

    #[error(
        "Download did not complete in {dir} after {waited:?} ({} in progress, {} finished)",
        in_progress.len(),
        finished.len()
    )]
    DownloadTimeout {
        dir: PathBuf,
        waited: Duration,
        in_progress: Vec<String>,
        finished: Vec<String>,
    },

    #[error("Download wait cancelled")]
    Cancelled,

    #[error("Unexpected file format for '{file}' (accepted: {accepted})")]
    FormatError { file: String, accepted: String },

    #[error("Cannot resolve identifier '{identifier}': {reason}")]
    NameResolution { identifier: String, reason: String },

    #[error("Malformed image metadata {}: {reason}", file.display())]
    ImageMetadata { file: PathBuf, reason: String },

    #[error("Session already closed")]
    SessionClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    #[error("Failed to launch Chrome: {0}")]
    LaunchFailed(String),

    #[error("Failed to connect to Chrome: {0}")]
    ConnectionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PpmiError {
    /// Errors after which the owning session must be torn down.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            PpmiError::DownloadTimeout { .. }
                | PpmiError::PermanentFailure(_)
                | PpmiError::RetryBudgetExceeded { .. }
                | PpmiError::Cancelled
        )
    }

    pub fn name_resolution(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        PpmiError::NameResolution {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }
}

impl From<InteractionError> for PpmiError {
    fn from(err: InteractionError) -> Self {
        match err {
            InteractionError::Transient(m) => PpmiError::TransientInteraction(m),
            InteractionError::Permanent(m) => PpmiError::PermanentFailure(m),
        }
    }
}

pub type Result<T> = std::result::Result<T, PpmiError>;
