use std::time::Duration;
use thiserror::Error;

use crate::timeout::TimeoutKind;

/// Error types for process supervision
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Unable to launch a new process: {0}")]
    Launch(#[source] std::io::Error),

    #[error("The process exceeded the {kind} timeout of {limit:?}")]
    Timeout { kind: TimeoutKind, limit: Duration },

    #[error("Error while sending signal {signal}: {reason}")]
    SignalDelivery { signal: i32, reason: String },

    #[error("The process has been signaled with signal \"{0}\"")]
    UnexpectedSignal(i32),

    #[error("The command failed with exit code {code} ({text})")]
    Failed { code: i32, text: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }

    /// Check if this error was raised because a deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }

    /// Check if this error indicates a permanent failure
    ///
    /// Retrying the same call on the same handle can never succeed for these.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProcessError::Configuration(_) | ProcessError::Lifecycle(_) | ProcessError::Launch(_)
        )
    }
}

impl From<derive_builder::UninitializedFieldError> for ProcessError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        ProcessError::Configuration(e.to_string())
    }
}

pub type Result<T, E = ProcessError> = std::result::Result<T, E>;
