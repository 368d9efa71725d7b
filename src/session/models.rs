//! Session data models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::BackendKind;
use crate::events::Event;
use crate::session::SessionKey;

/// Session status as reported by the owning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Backend resources are being set up; not yet usable.
    Provisioning,
    /// Agent is running and accepting messages.
    Running,
    /// Agent execution is suspended.
    Paused,
    /// Unrecoverable failure; the session can only be removed.
    Error,
    /// Agent signalled completion or the session was torn down.
    Completed,
}

impl SessionStatus {
    /// Whether the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Completed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Provisioning => write!(f, "provisioning"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provisioning" => Ok(SessionStatus::Provisioning),
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "error" => Ok(SessionStatus::Error),
            "completed" => Ok(SessionStatus::Completed),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// Model configuration injected into the agent runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider slug (e.g., "anthropic").
    pub provider: String,
    /// Model identifier.
    pub model: String,
}

/// Per-session credentials supplied by the route layer.
///
/// The credential store itself lives outside this crate; values arrive
/// already resolved.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Provider API key for the agent's model calls.
    pub api_key: Option<String>,
    /// Additional environment entries (tokens, endpoints).
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    // Never print key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("extra_env_keys", &self.extra_env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Request to create a new session.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub key: SessionKey,
    pub credentials: Credentials,
    pub model: ModelConfig,
    /// Workspace directory; guaranteed by the provisioner to exist.
    pub workspace_path: std::path::PathBuf,
    /// When true, the handle carries a bounded event receiver fed by the
    /// backend's ingest path.
    pub subscribe_events: bool,
}

/// Handle returned to the caller after a successful create.
pub struct SessionHandle {
    pub key: SessionKey,
    pub backend: BackendKind,
    pub status: SessionStatus,
    /// Bounded event channel, present when the request asked for one.
    pub events: Option<mpsc::Receiver<Event>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key", &self.key)
            .field("backend", &self.backend)
            .field("status", &self.status)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// Acknowledgement that a message was accepted for delivery.
///
/// Responses surface asynchronously as events; this is not a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    pub key: SessionKey,
    pub accepted: bool,
}

/// Point-in-time view of a session's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub key: SessionKey,
    pub backend: BackendKind,
    pub status: SessionStatus,
    /// Highest event sequence number appended so far.
    pub last_event_seq: u64,
}

/// Observability counters for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Currently preferred backend for new sessions.
    pub mode: BackendKind,
    pub local_sessions: usize,
    pub remote_sessions: usize,
}
