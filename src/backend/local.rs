//! Local containerized backend.
//!
//! Runs the agent inside a container on this host. The container is named
//! deterministically from the session key, the workspace is bind-mounted at
//! /workspace, and credentials plus model configuration are injected as
//! environment variables. The agent's inbound channel is the `tether-agent`
//! helper inside the container, driven over `exec`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{BackendKind, RuntimeBackend};
use crate::engine::{ContainerSpec, EngineApi, EngineError};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EventKind, EventLog};
use crate::readiness::{Readiness, ReadinessWaiter, WaitError};
use crate::session::{
    Credentials, MessageAck, ModelConfig, SessionKey, SessionStatus, StatusSnapshot,
};

/// Configuration for the local backend.
#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    /// Container image running the agent.
    pub image: String,
    /// Total readiness budget for container startup.
    pub provision_timeout: std::time::Duration,
    /// Spacing between readiness probes.
    pub check_interval: std::time::Duration,
    /// Spacing between agent event ingest polls.
    pub event_poll_interval: std::time::Duration,
    /// Grace period passed to `stop` before the engine kills the container.
    pub stop_timeout_seconds: u32,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            image: "tether-agent:latest".to_string(),
            provision_timeout: std::time::Duration::from_secs(60),
            check_interval: std::time::Duration::from_millis(500),
            event_poll_interval: std::time::Duration::from_millis(750),
            stop_timeout_seconds: 10,
        }
    }
}

/// Event line as emitted by the in-container agent helper.
#[derive(Debug, serde::Deserialize)]
struct AgentWireEvent {
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Container-based runtime backend.
pub struct LocalBackend {
    key: SessionKey,
    config: LocalBackendConfig,
    engine: Arc<dyn EngineApi>,
    workspace_path: PathBuf,
    credentials: Credentials,
    model: ModelConfig,
    container_id: RwLock<Option<String>>,
    status: Arc<RwLock<SessionStatus>>,
    event_log: Arc<EventLog>,
    /// Cancels the ingest task on cleanup.
    ingest_cancel: CancellationToken,
}

impl LocalBackend {
    pub fn new(
        key: SessionKey,
        config: LocalBackendConfig,
        engine: Arc<dyn EngineApi>,
        workspace_path: PathBuf,
        credentials: Credentials,
        model: ModelConfig,
    ) -> Self {
        Self {
            key,
            config,
            engine,
            workspace_path,
            credentials,
            model,
            container_id: RwLock::new(None),
            status: Arc::new(RwLock::new(SessionStatus::Provisioning)),
            event_log: Arc::new(EventLog::new()),
            ingest_cancel: CancellationToken::new(),
        }
    }

    /// Attach a bounded event channel fed by the ingest task.
    pub fn subscribe_events(&self, capacity: usize) -> tokio::sync::mpsc::Receiver<Event> {
        self.event_log.subscribe(capacity)
    }

    fn container_spec(&self) -> ContainerSpec {
        let mut spec = ContainerSpec::new(self.key.container_name(), self.config.image.clone())
            .volume(
                self.workspace_path.to_string_lossy().to_string(),
                "/workspace".to_string(),
            )
            .workdir("/workspace")
            .env("TETHER_SESSION", self.key.to_string())
            .env("LLM_PROVIDER", self.model.provider.clone())
            .env("LLM_MODEL", self.model.model.clone());

        if let Some(ref api_key) = self.credentials.api_key {
            spec = spec.env("LLM_API_KEY", api_key.clone());
        }
        for (key, value) in &self.credentials.extra_env {
            spec = spec.env(key.clone(), value.clone());
        }
        spec
    }

    /// Background task polling the in-container agent for new events and
    /// appending them to the log. Stops on cancellation or when the agent
    /// signals completion.
    fn spawn_event_ingest(&self, container_id: String) {
        let engine = self.engine.clone();
        let log = self.event_log.clone();
        let status = self.status.clone();
        let cancel = self.ingest_cancel.clone();
        let interval = self.config.event_poll_interval;
        let key = self.key.clone();

        tokio::spawn(async move {
            let mut cursor: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let since = cursor.to_string();
                let output = match engine
                    .exec_output(&container_id, &["tether-agent", "events", "--since", &since])
                    .await
                {
                    Ok(output) => output,
                    Err(e) => {
                        debug!("event ingest for {} skipped a poll: {}", key, e);
                        continue;
                    }
                };

                let mut completed = false;
                for line in output.lines().filter(|l| !l.trim().is_empty()) {
                    // the cursor is a line offset on the agent side: every
                    // received line counts, parsed or not, or the events
                    // after a bad line get fetched again next poll
                    cursor += 1;
                    match serde_json::from_str::<AgentWireEvent>(line) {
                        Ok(wire) => {
                            let kind = EventKind::from_wire(&wire.kind);
                            completed |= kind == EventKind::Completed;
                            log.append(kind, wire.payload);
                        }
                        Err(e) => warn!("unparseable agent event for {}: {}", key, e),
                    }
                }

                if completed {
                    let mut status = status.write().await;
                    if !status.is_terminal() {
                        *status = SessionStatus::Completed;
                    }
                    break;
                }
            }
            debug!("event ingest for {} stopped", key);
        });
    }

    async fn set_status(&self, next: SessionStatus) {
        let mut status = self.status.write().await;
        if *status != next {
            debug!("session {} status {} -> {}", self.key, *status, next);
            *status = next;
        }
    }
}

#[async_trait]
impl RuntimeBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn start(&self, cancel: &CancellationToken) -> OrchestratorResult<()> {
        self.engine.ping().await.map_err(|e| {
            OrchestratorError::BackendUnavailable {
                backend: BackendKind::Local,
                reason: e.to_string(),
            }
        })?;

        // A stale container under this name (crashed orchestrator, aborted
        // failover) blocks `run --name`; clear it first.
        let name = self.key.container_name();
        if let Err(e) = self.engine.remove_container(&name, true).await {
            debug!("no stale container to remove for {}: {}", self.key, e);
        }

        let spec = self.container_spec();
        let container_id = self.engine.create_container(&spec).await.map_err(|e| {
            if e.is_engine_unavailable() {
                OrchestratorError::BackendUnavailable {
                    backend: BackendKind::Local,
                    reason: e.to_string(),
                }
            } else {
                OrchestratorError::ProvisioningFatal {
                    backend: BackendKind::Local,
                    reason: e.to_string(),
                }
            }
        })?;
        info!(
            "session {} launched container {} ({})",
            self.key, name, container_id
        );
        *self.container_id.write().await = Some(container_id.clone());

        let waiter = ReadinessWaiter::new(self.config.provision_timeout, self.config.check_interval);
        let result = waiter
            .wait("container", cancel, || {
                let engine = self.engine.clone();
                let id = container_id.clone();
                async move {
                    match engine.container_state_status(&id).await {
                        Ok(Some(state)) if state == "running" => Readiness::Ready,
                        Ok(Some(state)) if state == "exited" || state == "dead" => {
                            let logs = engine
                                .container_logs(&id, Some(50))
                                .await
                                .unwrap_or_default();
                            Readiness::Fatal(format!(
                                "container {} during startup: {}",
                                state,
                                logs.trim()
                            ))
                        }
                        Ok(Some(state)) => Readiness::NotReady(state),
                        Ok(None) => Readiness::Fatal("container disappeared".to_string()),
                        // transient inspect failure; keep polling
                        Err(e) => Readiness::NotReady(e.to_string()),
                    }
                }
            })
            .await;

        match result {
            Ok(()) => {}
            Err(WaitError::TimedOut { waited, .. }) => {
                self.set_status(SessionStatus::Error).await;
                return Err(OrchestratorError::ProvisioningTimeout {
                    backend: BackendKind::Local,
                    waited,
                });
            }
            Err(WaitError::Fatal(reason)) => {
                self.set_status(SessionStatus::Error).await;
                return Err(OrchestratorError::ProvisioningFatal {
                    backend: BackendKind::Local,
                    reason,
                });
            }
            Err(WaitError::Cancelled) => return Err(OrchestratorError::Cancelled),
        }

        self.set_status(SessionStatus::Running).await;
        self.event_log.append(
            EventKind::StatusChange,
            serde_json::json!({ "status": "running", "backend": "local" }),
        );
        self.spawn_event_ingest(container_id);
        Ok(())
    }

    async fn send_message(&self, text: &str, _run: bool) -> OrchestratorResult<MessageAck> {
        let container_id = self
            .container_id
            .read()
            .await
            .clone()
            .ok_or_else(|| OrchestratorError::transient("send_message", "session has no container"))?;

        self.engine
            .exec_detached(&container_id, &["tether-agent", "send", text])
            .await
            .map_err(|e| OrchestratorError::transient("send_message", e))?;

        Ok(MessageAck {
            key: self.key.clone(),
            accepted: true,
        })
    }

    async fn pause(&self) -> OrchestratorResult<bool> {
        let container_id = match self.container_id.read().await.clone() {
            Some(id) => id,
            None => return Ok(false),
        };
        if *self.status.read().await != SessionStatus::Running {
            return Ok(false);
        }

        self.engine
            .pause_container(&container_id)
            .await
            .map_err(|e| OrchestratorError::transient("pause", e))?;
        self.set_status(SessionStatus::Paused).await;
        Ok(true)
    }

    async fn resume(&self) -> OrchestratorResult<bool> {
        let container_id = match self.container_id.read().await.clone() {
            Some(id) => id,
            None => return Ok(false),
        };
        if *self.status.read().await != SessionStatus::Paused {
            return Ok(false);
        }

        self.engine
            .unpause_container(&container_id)
            .await
            .map_err(|e| OrchestratorError::transient("resume", e))?;
        self.set_status(SessionStatus::Running).await;
        Ok(true)
    }

    async fn status(&self) -> OrchestratorResult<StatusSnapshot> {
        let stored = *self.status.read().await;
        let container_id = self.container_id.read().await.clone();

        // Reconcile container liveness with the last-known agent status.
        let status = match (container_id, stored) {
            (_, s) if s.is_terminal() => s,
            (Some(id), s) => match self.engine.container_state_status(&id).await {
                Ok(Some(state)) if state == "running" => s,
                Ok(Some(state)) if state == "paused" => SessionStatus::Paused,
                Ok(Some(_)) | Ok(None) => {
                    self.set_status(SessionStatus::Error).await;
                    SessionStatus::Error
                }
                // inspect hiccup: report what we knew
                Err(_) => s,
            },
            (None, s) => s,
        };

        Ok(StatusSnapshot {
            key: self.key.clone(),
            backend: BackendKind::Local,
            status,
            last_event_seq: self.event_log.last_seq(),
        })
    }

    async fn events_since(&self, since: u64) -> OrchestratorResult<Vec<Event>> {
        Ok(self.event_log.events_since(since))
    }

    async fn cleanup(&self) -> OrchestratorResult<()> {
        self.ingest_cancel.cancel();

        let container_id = self.container_id.write().await.take();
        if let Some(id) = container_id {
            if let Err(e) = self
                .engine
                .stop_container(&id, Some(self.config.stop_timeout_seconds))
                .await
            {
                warn!("stopping container for {} failed: {}", self.key, e);
            }
            if let Err(e) = self.engine.remove_container(&id, true).await {
                warn!("removing container for {} failed: {}", self.key, e);
            }
            info!("session {} container removed", self.key);
        }

        self.set_status(SessionStatus::Completed).await;
        Ok(())
    }
}
