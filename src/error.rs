//! Error taxonomy for the destroy pipeline
//!
//! Every fallible operation in the crate returns [`DestroyError`]. Callers
//! that need to branch on the failure class use [`DestroyError::kind`], which
//! sees through the phase wrapping added by the top-level destroyer.

use crate::cache::CacheError;
use crate::tmplock::TmpLockError;
use thiserror::Error;

/// Failure classes callers can pattern-match on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Cache,
    Precondition,
    LockContended,
    Remote,
    InfraEngine,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Cache => "cache",
            ErrorKind::Precondition => "precondition",
            ErrorKind::LockContended => "lock-contended",
            ErrorKind::Remote => "remote",
            ErrorKind::InfraEngine => "infra-engine",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DestroyError {
    /// Bad or missing cluster configuration
    #[error("Invalid cluster configuration: {0}")]
    Config(String),

    #[error("State cache error: {0}")]
    Cache(#[from] CacheError),

    /// A required collaborator was not provided
    #[error("Missing required collaborator: {0}")]
    Precondition(String),

    #[error("Lock is held elsewhere: {0}")]
    LockContended(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// SSH command, file download or API interaction failed
    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Infrastructure engine failed: {0}")]
    InfraEngine(String),

    /// Engine failed after changing its state; `state` is what it left behind
    #[error("Infrastructure engine failed: {message}")]
    InfraEnginePartial { message: String, state: Vec<u8> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("phase {phase}: {source}")]
    InPhase {
        phase: String,
        #[source]
        source: Box<DestroyError>,
    },
}

impl DestroyError {
    /// Classify the error, looking through phase wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            DestroyError::Config(_) => ErrorKind::Config,
            DestroyError::Cache(_) => ErrorKind::Cache,
            DestroyError::Precondition(_) => ErrorKind::Precondition,
            DestroyError::LockContended(_) => ErrorKind::LockContended,
            DestroyError::Kube(_) | DestroyError::Remote(_) => ErrorKind::Remote,
            DestroyError::InfraEngine(_) | DestroyError::InfraEnginePartial { .. } => {
                ErrorKind::InfraEngine
            }
            DestroyError::Cancelled => ErrorKind::Cancelled,
            DestroyError::Internal(_) => ErrorKind::Internal,
            DestroyError::Io(_) => ErrorKind::Internal,
            DestroyError::InPhase { source, .. } => source.kind(),
        }
    }

    /// Attach the name of the phase the error surfaced in
    pub fn in_phase(self, phase: impl Into<String>) -> Self {
        match self {
            // Cancellation stays unwrapped so shutdown paths can match it directly
            DestroyError::Cancelled => DestroyError::Cancelled,
            other => DestroyError::InPhase {
                phase: phase.into(),
                source: Box::new(other),
            },
        }
    }

    /// State the infrastructure engine left behind before failing
    pub fn partial_state(&self) -> Option<&[u8]> {
        match self {
            DestroyError::InfraEnginePartial { state, .. } => Some(state),
            DestroyError::InPhase { source, .. } => source.partial_state(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<TmpLockError> for DestroyError {
    fn from(err: TmpLockError) -> Self {
        match err {
            TmpLockError::Held { .. } => DestroyError::LockContended(err.to_string()),
            TmpLockError::Io(io) => DestroyError::Io(io),
        }
    }
}

pub type Result<T, E = DestroyError> = std::result::Result<T, E>;

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
