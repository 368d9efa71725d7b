//! Backend dispatch and failover.
//!
//! Tracks which backend new sessions should use. The preference flag is
//! read by every new-session request and written only by the availability
//! probe and the explicit override calls, so a plain read-mostly lock is
//! enough.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::{info, warn};

use crate::backend::BackendKind;
use crate::engine::EngineApi;

/// Decides which backend implementation new sessions use.
pub struct Dispatcher {
    engine: Arc<dyn EngineApi>,
    preferred: RwLock<BackendKind>,
    force_remote: AtomicBool,
}

impl Dispatcher {
    /// Build a dispatcher preferring the local backend until a probe or
    /// failover says otherwise. Call `probe_local_availability` once at
    /// startup (and on whatever cadence the embedding layer wants).
    pub fn new(engine: Arc<dyn EngineApi>) -> Self {
        Self {
            engine,
            preferred: RwLock::new(BackendKind::Local),
            force_remote: AtomicBool::new(false),
        }
    }

    /// Probe the local execution environment and record the result in the
    /// preference flag. Returns whether local is available.
    pub async fn probe_local_availability(&self) -> bool {
        match self.engine.ping().await {
            Ok(()) => {
                *self.preferred.write().expect("dispatcher lock poisoned") = BackendKind::Local;
                true
            }
            Err(e) => {
                warn!("local engine unavailable, preferring remote: {}", e);
                *self.preferred.write().expect("dispatcher lock poisoned") = BackendKind::Remote;
                false
            }
        }
    }

    /// Backend kind new sessions should use right now.
    pub fn resolve(&self) -> BackendKind {
        if self.force_remote.load(Ordering::SeqCst) {
            return BackendKind::Remote;
        }
        *self.preferred.read().expect("dispatcher lock poisoned")
    }

    /// Pin new sessions to the remote backend until `retry_local` succeeds.
    pub fn force_remote(&self) {
        info!("forcing remote backend for new sessions");
        self.force_remote.store(true, Ordering::SeqCst);
    }

    /// Re-run the local probe; clears the force-remote override and flips
    /// back to local only when the probe succeeds.
    pub async fn retry_local(&self) -> bool {
        if self.probe_local_availability().await {
            self.force_remote.store(false, Ordering::SeqCst);
            info!("local backend available again");
            true
        } else {
            false
        }
    }

    /// Record that the local backend failed mid-create; new sessions go
    /// remote until a successful `retry_local`.
    pub fn mark_local_unavailable(&self, reason: &str) {
        warn!("marking local backend unavailable: {}", reason);
        *self.preferred.write().expect("dispatcher lock poisoned") = BackendKind::Remote;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerSpec, EngineError, EngineResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FlakyEngine {
        available: AtomicBool,
    }

    #[async_trait]
    impl EngineApi for FlakyEngine {
        async fn ping(&self) -> EngineResult<()> {
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(EngineError::EngineUnavailable("down".to_string()))
            }
        }
        async fn create_container(&self, _spec: &ContainerSpec) -> EngineResult<String> {
            unimplemented!("not exercised")
        }
        async fn stop_container(&self, _id: &str, _t: Option<u32>) -> EngineResult<()> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str, _force: bool) -> EngineResult<()> {
            Ok(())
        }
        async fn pause_container(&self, _id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn unpause_container(&self, _id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn container_state_status(&self, _id: &str) -> EngineResult<Option<String>> {
            Ok(None)
        }
        async fn container_logs(&self, _id: &str, _tail: Option<u32>) -> EngineResult<String> {
            Ok(String::new())
        }
        async fn exec_detached(&self, _id: &str, _cmd: &[&str]) -> EngineResult<()> {
            Ok(())
        }
        async fn exec_output(&self, _id: &str, _cmd: &[&str]) -> EngineResult<String> {
            Ok(String::new())
        }
    }

    fn dispatcher(available: bool) -> (Dispatcher, Arc<FlakyEngine>) {
        let engine = Arc::new(FlakyEngine {
            available: AtomicBool::new(available),
        });
        (Dispatcher::new(engine.clone()), engine)
    }

    #[tokio::test]
    async fn test_failed_probe_prefers_remote_until_retry_succeeds() {
        let (dispatcher, engine) = dispatcher(false);

        assert!(!dispatcher.probe_local_availability().await);
        assert_eq!(dispatcher.resolve(), BackendKind::Remote);

        // still down: stays remote
        assert!(!dispatcher.retry_local().await);
        assert_eq!(dispatcher.resolve(), BackendKind::Remote);

        engine.available.store(true, Ordering::SeqCst);
        assert!(dispatcher.retry_local().await);
        assert_eq!(dispatcher.resolve(), BackendKind::Local);
    }

    #[tokio::test]
    async fn test_force_remote_overrides_local_preference() {
        let (dispatcher, _engine) = dispatcher(true);
        assert!(dispatcher.probe_local_availability().await);
        assert_eq!(dispatcher.resolve(), BackendKind::Local);

        dispatcher.force_remote();
        assert_eq!(dispatcher.resolve(), BackendKind::Remote);

        // retry clears the override when the probe passes
        assert!(dispatcher.retry_local().await);
        assert_eq!(dispatcher.resolve(), BackendKind::Local);
    }

    #[tokio::test]
    async fn test_mark_local_unavailable() {
        let (dispatcher, _engine) = dispatcher(true);
        assert!(dispatcher.probe_local_availability().await);

        dispatcher.mark_local_unavailable("container launch failed");
        assert_eq!(dispatcher.resolve(), BackendKind::Remote);
    }
}
