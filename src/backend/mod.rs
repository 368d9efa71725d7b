//! Runtime backends - unified interface for local container and hosted
//! remote execution.
//!
//! Both backends implement the same trait, so the registry and facade use
//! identical code paths regardless of where the agent actually runs.

mod local;
mod remote;

pub use local::{LocalBackend, LocalBackendConfig};
pub use remote::{RemoteBackend, RemoteBackendConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorResult;
use crate::events::Event;
use crate::session::{MessageAck, StatusSnapshot};

/// Concrete execution environment behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Containerized agent on this host.
    Local,
    /// Hosted runtime reached over HTTP.
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

/// Capability set shared by the local and remote backends.
///
/// Implementations own their backend-specific handles (container ID, or
/// remote runtime/conversation IDs), a status, and an event log. All calls
/// that do I/O carry internal timeouts; none block indefinitely.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Provision the backend and block until it is usable, bounded by the
    /// readiness budget. Cancelling the token interrupts the wait promptly.
    async fn start(&self, cancel: &CancellationToken) -> OrchestratorResult<()>;

    /// Hand a message to the agent's inbound channel. The ack means the
    /// message was accepted, not answered; responses surface as events.
    /// `run` asks the runtime to resume agent execution after ingesting the
    /// message; the local backend's agent always consumes its inbox, so it
    /// accepts and ignores the flag.
    async fn send_message(&self, text: &str, run: bool) -> OrchestratorResult<MessageAck>;

    /// Suspend agent execution. Returns whether the request was accepted.
    async fn pause(&self) -> OrchestratorResult<bool>;

    /// Resume a paused agent. Returns whether the request was accepted.
    async fn resume(&self) -> OrchestratorResult<bool>;

    /// Point-in-time status, reconciling backend liveness with the
    /// last-known agent state.
    async fn status(&self) -> OrchestratorResult<StatusSnapshot>;

    /// Events with sequence numbers strictly greater than `since`.
    async fn events_since(&self, since: u64) -> OrchestratorResult<Vec<Event>>;

    /// Release backend resources. Idempotent, safe after a failed start,
    /// and best-effort: callers log the error and move on.
    async fn cleanup(&self) -> OrchestratorResult<()>;
}
