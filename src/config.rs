//! Orchestrator configuration.

use crate::backend::{LocalBackendConfig, RemoteBackendConfig};

/// Top-level configuration, split per backend plus the facade's own knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Local container backend settings.
    pub local: LocalBackendConfig,
    /// Hosted remote backend settings.
    pub remote: RemoteBackendConfig,
    /// Capacity of per-session event subscription channels.
    pub event_channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            local: LocalBackendConfig::default(),
            remote: RemoteBackendConfig::default(),
            event_channel_capacity: 256,
        }
    }
}
