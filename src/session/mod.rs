//! Session identity, models, and the keyed registry.

pub mod key;
pub mod models;
pub mod registry;

pub use key::SessionKey;
pub use models::{
    CreateSessionRequest, Credentials, MessageAck, ModelConfig, OrchestratorStats, SessionHandle,
    SessionStatus, StatusSnapshot,
};
pub use registry::{SessionEntry, SessionRegistry};
