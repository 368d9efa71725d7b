//! Session identity.

use serde::{Deserialize, Serialize};

/// Composite key identifying at most one active runtime backend.
///
/// Immutable once created; the registry serializes all mutations per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Platform user ID.
    pub user_id: String,
    /// Application slug.
    pub app: String,
    /// Session slug within the application.
    pub session: String,
}

impl SessionKey {
    pub fn new(
        user_id: impl Into<String>,
        app: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            app: app.into(),
            session: session.into(),
        }
    }

    /// Deterministic container name for this key.
    ///
    /// Used both when launching the local backend and for best-effort
    /// cross-backend cleanup, so a mid-session failover cannot leak a
    /// container under a name nobody remembers.
    pub fn container_name(&self) -> String {
        format!("tether-{}-{}-{}", self.user_id, self.app, self.session)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.app, self.session)
    }
}
