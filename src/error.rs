//! Orchestrator error types.
//!
//! Callers see this closed set only; raw transport and engine errors are
//! classified into it by the backends before they cross the facade.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::session::SessionKey;

/// Result type for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors that can surface from session orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The execution environment for a backend is unreachable.
    ///
    /// Triggers failover when an alternate backend exists; surfaced only
    /// when no backend can take the session.
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable {
        backend: BackendKind,
        reason: String,
    },

    /// Readiness was not reached within the provisioning budget. Retryable.
    #[error("{backend} backend not ready after {waited:?}")]
    ProvisioningTimeout {
        backend: BackendKind,
        waited: Duration,
    },

    /// The backend reported an unrecoverable startup error. Not retryable.
    #[error("{backend} backend failed to provision: {reason}")]
    ProvisioningFatal {
        backend: BackendKind,
        reason: String,
    },

    /// A live session already exists for the key.
    #[error("session already exists: {0}")]
    DuplicateSession(SessionKey),

    /// No session is registered for the key.
    #[error("session not found: {0}")]
    SessionNotFound(SessionKey),

    /// An individual call to the backend failed after bounded retries.
    #[error("{operation} failed: {reason}")]
    Transient { operation: String, reason: String },

    /// The operation was interrupted by session teardown.
    #[error("operation cancelled by session teardown")]
    Cancelled,
}

impl OrchestratorError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ProvisioningTimeout { .. } | OrchestratorError::Transient { .. }
        )
    }

    pub(crate) fn transient(operation: impl Into<String>, reason: impl ToString) -> Self {
        OrchestratorError::Transient {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}
