//! Hosted runtime wire types and error classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for hosted runtime calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors from the hosted execution service.
///
/// Non-2xx responses are classified by status code: 4xx is a caller error,
/// 5xx and transport failures are retryable.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("request to {url} failed: {message}")]
    Connection { url: String, message: String },

    /// API key rejected.
    #[error("unauthorized: hosted runtime rejected the API key")]
    Unauthorized,

    /// Resource does not exist on the service.
    #[error("not found: {0}")]
    NotFound(String),

    /// Other 4xx: the request itself is wrong; retrying will not help.
    #[error("hosted runtime rejected request ({status}): {message}")]
    CallerError { status: u16, message: String },

    /// 5xx: service-side failure, retryable.
    #[error("hosted runtime error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// Response body did not parse.
    #[error("failed to parse hosted runtime response: {0}")]
    Parse(String),
}

impl RemoteError {
    /// Whether a bounded retry with backoff is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection { .. } | RemoteError::ServerError { .. }
        )
    }
}

/// Lifecycle status of a hosted runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Provisioning,
    Ready,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeInfo {
    pub id: String,
    pub state: RuntimeState,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Agent status within a hosted conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Starting,
    Running,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationInfo {
    pub id: String,
    pub agent_state: AgentState,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Request body for conversation creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreateConversationRequest {
    pub provider: String,
    pub model: String,
    pub workspace_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Request body for message posting.
#[derive(Debug, Clone, Serialize)]
pub struct PostMessageRequest {
    pub text: String,
    /// When true the runtime resumes agent execution after ingesting the
    /// message; when false it only enqueues it.
    pub run: bool,
}

/// Acceptance response from message/pause/resume endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

/// One event as emitted by the hosted runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEvent {
    /// Service-side cursor; independent of the local event log sequence.
    pub seq: u64,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<RemoteEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
}

/// Error body the service returns on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
}
