//! Error taxonomy shared by the supervisor, the bridge, and the dispatcher.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Failure reported by the worker for one command.
///
/// This is both the body of an `error` response frame and the payload of
/// [`Error::RemoteExecution`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        if let Some(ref trace) = self.trace {
            write!(f, "\n{}", trace)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bundle missing, extraction failed, or dependency resolution exited non-zero.
    #[error("installation failed: {0}")]
    Installation(String),

    #[error("worker did not become ready within {0:?}")]
    StartupTimeout(Duration),

    /// Worker could not be spawned or exited before becoming ready.
    #[error("worker failed to start: {0}")]
    Startup(String),

    /// Malformed frame, unexpected EOF, reset, or request timeout.
    /// The session that produced it must be discarded.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker reported an error: {0}")]
    RemoteExecution(RemoteFailure),

    #[error("failed to load recipe: {0}")]
    RecipeLoad(String),

    #[error("cannot {operation} while worker is {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::supervisor::WorkerState,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Only command-level worker failures leave the session usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RemoteExecution(_))
    }

    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
