//! Orchestrator facade.
//!
//! The single surface the route layer talks to: session creation with
//! failover, message forwarding, pause/resume, status, event retrieval,
//! removal, and stats. Explicitly constructed and passed to callers; no
//! module-level singletons.

use std::sync::Arc;

use log::{info, warn};

use crate::backend::{
    BackendKind, LocalBackend, RemoteBackend, RuntimeBackend,
};
use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::EngineApi;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::Event;
use crate::remote::RemoteApi;
use crate::session::{
    CreateSessionRequest, MessageAck, OrchestratorStats, SessionHandle, SessionKey,
    SessionRegistry, StatusSnapshot,
};

/// Session orchestrator over the local container engine and the hosted
/// execution service.
pub struct Orchestrator {
    config: OrchestratorConfig,
    engine: Arc<dyn EngineApi>,
    remote: Arc<dyn RemoteApi>,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<dyn EngineApi>,
        remote: Arc<dyn RemoteApi>,
    ) -> Self {
        let dispatcher = Dispatcher::new(engine.clone());
        Self {
            config,
            engine,
            remote,
            registry: SessionRegistry::new(),
            dispatcher,
        }
    }

    /// Probe the local engine and record the preferred backend. Run once at
    /// startup; re-run on whatever cadence the embedding layer wants.
    pub async fn probe_local_availability(&self) -> bool {
        self.dispatcher.probe_local_availability().await
    }

    /// Probe the hosted execution service. Does not change routing; lets
    /// the embedding layer check whether a failover target exists before
    /// forcing one.
    pub async fn probe_remote_availability(&self) -> bool {
        match self.remote.health().await {
            Ok(()) => true,
            Err(e) => {
                warn!("hosted execution service unavailable: {}", e);
                false
            }
        }
    }

    /// Pin new sessions to the remote backend.
    pub fn force_remote(&self) {
        self.dispatcher.force_remote();
    }

    /// Re-probe the local engine; flips back to local only on success.
    pub async fn retry_local(&self) -> bool {
        self.dispatcher.retry_local().await
    }

    /// Create a session for the key, provisioning via the preferred
    /// backend and failing over to remote when the local environment turns
    /// out to be unavailable. At most one session ever exists per key.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> OrchestratorResult<SessionHandle> {
        let kind = self.dispatcher.resolve();
        match self.try_create(&request, kind).await {
            Ok(handle) => Ok(handle),
            Err(OrchestratorError::BackendUnavailable { backend, reason })
                if backend == BackendKind::Local =>
            {
                self.dispatcher.mark_local_unavailable(&reason);
                info!(
                    "session {} failing over to remote backend: {}",
                    request.key, reason
                );
                self.try_create(&request, BackendKind::Remote).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_create(
        &self,
        request: &CreateSessionRequest,
        kind: BackendKind,
    ) -> OrchestratorResult<SessionHandle> {
        let mut events_rx = None;

        let entry = self
            .registry
            .create_exclusive(&request.key, |cancel| {
                let events_rx = &mut events_rx;
                async move {
                    let backend: Arc<dyn RuntimeBackend> = match kind {
                        BackendKind::Local => {
                            let backend = LocalBackend::new(
                                request.key.clone(),
                                self.config.local.clone(),
                                self.engine.clone(),
                                request.workspace_path.clone(),
                                request.credentials.clone(),
                                request.model.clone(),
                            );
                            if request.subscribe_events {
                                *events_rx = Some(
                                    backend.subscribe_events(self.config.event_channel_capacity),
                                );
                            }
                            Arc::new(backend)
                        }
                        BackendKind::Remote => {
                            let mut remote_config = self.config.remote.clone();
                            // a subscriber needs the log fed continuously
                            remote_config.subscribe |= request.subscribe_events;
                            let backend = RemoteBackend::new(
                                request.key.clone(),
                                remote_config,
                                self.remote.clone(),
                                request.workspace_path.clone(),
                                request.credentials.clone(),
                                request.model.clone(),
                            );
                            if request.subscribe_events {
                                *events_rx = Some(
                                    backend.subscribe_events(self.config.event_channel_capacity),
                                );
                            }
                            Arc::new(backend)
                        }
                    };

                    if let Err(e) = backend.start(&cancel).await {
                        // safe after a failed start; releases anything the
                        // partial provisioning left behind
                        if let Err(cleanup_err) = backend.cleanup().await {
                            warn!(
                                "cleanup after failed start of {} failed: {}",
                                request.key, cleanup_err
                            );
                        }
                        return Err(e);
                    }
                    Ok(backend)
                }
            })
            .await?;

        let snapshot = entry.backend.status().await?;
        info!(
            "session {} created on {} backend",
            request.key,
            entry.backend.kind()
        );
        Ok(SessionHandle {
            key: request.key.clone(),
            backend: entry.backend.kind(),
            status: snapshot.status,
            events: events_rx,
        })
    }

    fn backend_for(&self, key: &SessionKey) -> OrchestratorResult<Arc<dyn RuntimeBackend>> {
        self.registry
            .get(key)
            .map(|entry| entry.backend.clone())
            .ok_or_else(|| OrchestratorError::SessionNotFound(key.clone()))
    }

    /// Forward a message to the session's agent. The ack means accepted,
    /// not answered.
    pub async fn send_message(&self, key: &SessionKey, text: &str) -> OrchestratorResult<MessageAck> {
        self.backend_for(key)?.send_message(text, true).await
    }

    pub async fn pause(&self, key: &SessionKey) -> OrchestratorResult<bool> {
        self.backend_for(key)?.pause().await
    }

    pub async fn resume(&self, key: &SessionKey) -> OrchestratorResult<bool> {
        self.backend_for(key)?.resume().await
    }

    pub async fn status(&self, key: &SessionKey) -> OrchestratorResult<StatusSnapshot> {
        self.backend_for(key)?.status().await
    }

    /// Events with sequence numbers strictly greater than `since`.
    pub async fn events(&self, key: &SessionKey, since: u64) -> OrchestratorResult<Vec<Event>> {
        self.backend_for(key)?.events_since(since).await
    }

    /// Remove a session and release its resources. Idempotent; returns
    /// whether an entry existed. Cleanup runs against both backends for the
    /// key: the registered backend tears itself down, and any container
    /// under the key's deterministic name is force-removed so a mid-session
    /// failover cannot leak one.
    pub async fn remove_session(&self, key: &SessionKey) -> bool {
        let existed = self.registry.remove(key).await;

        let name = key.container_name();
        if let Err(e) = self.engine.remove_container(&name, true).await {
            // expected whenever the session never ran locally
            log::debug!("no local container {} to remove: {}", name, e);
        }

        existed
    }

    /// Observability snapshot: current mode plus active sessions per
    /// backend.
    pub fn stats(&self) -> OrchestratorStats {
        let (local_sessions, remote_sessions) = self.registry.counts();
        OrchestratorStats {
            mode: self.dispatcher.resolve(),
            local_sessions,
            remote_sessions,
        }
    }
}
