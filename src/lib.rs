//! Agent session orchestration over a local container engine and a hosted
//! execution service.
//!
//! The crate exposes a single [`Orchestrator`] facade. It provisions agent
//! sessions on the local container engine when one is reachable, fails over
//! to the hosted service when it is not, and keeps exactly one backend per
//! session key. Events flow through per-session append-only logs with
//! gap-free sequence numbers, consumable by polling or through a bounded
//! subscription channel.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod readiness;
pub mod remote;
pub mod service;
pub mod session;

pub use backend::{BackendKind, LocalBackendConfig, RemoteBackendConfig, RuntimeBackend};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{Event, EventKind};
pub use service::Orchestrator;
pub use session::{
    CreateSessionRequest, Credentials, MessageAck, ModelConfig, OrchestratorStats, SessionHandle,
    SessionKey, SessionStatus, StatusSnapshot,
};
