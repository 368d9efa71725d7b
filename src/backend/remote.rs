//! Hosted remote backend.
//!
//! Provisions a runtime on the hosted execution service, waits for it to
//! become ready and for the agent inside it to come alive, then proxies
//! conversation calls to it. Teardown deprovisions the conversation and the
//! runtime, tolerating either call failing independently.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{BackendKind, RuntimeBackend};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EventKind, EventLog};
use crate::readiness::{Readiness, ReadinessWaiter, WaitError};
use crate::remote::{
    AgentState, CreateConversationRequest, PostMessageRequest, RemoteApi, RemoteError,
    RemoteEvent, RuntimeState,
};
use crate::session::{
    Credentials, MessageAck, ModelConfig, SessionKey, SessionStatus, StatusSnapshot,
};

/// Configuration for the remote backend.
#[derive(Debug, Clone)]
pub struct RemoteBackendConfig {
    /// Readiness budget for the runtime-level health probe.
    pub runtime_ready_timeout: std::time::Duration,
    /// Readiness budget for the agent-level alive probe. The combined wait
    /// is bounded by the sum of the two budgets.
    pub agent_alive_timeout: std::time::Duration,
    /// Spacing between readiness probes.
    pub check_interval: std::time::Duration,
    /// When true, start a subscription task that keeps the event log
    /// populated; `events_since` then drains the log instead of pulling.
    pub subscribe: bool,
    /// Spacing between subscription polls.
    pub event_poll_interval: std::time::Duration,
    /// Page size for event fetches.
    pub event_fetch_limit: usize,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            runtime_ready_timeout: std::time::Duration::from_secs(120),
            agent_alive_timeout: std::time::Duration::from_secs(60),
            check_interval: std::time::Duration::from_secs(1),
            subscribe: false,
            event_poll_interval: std::time::Duration::from_secs(1),
            event_fetch_limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
struct RemoteIds {
    runtime_id: String,
    conversation_id: String,
}

/// Hosted runtime backend.
pub struct RemoteBackend {
    key: SessionKey,
    config: RemoteBackendConfig,
    api: Arc<dyn RemoteApi>,
    workspace_path: PathBuf,
    credentials: Credentials,
    model: ModelConfig,
    /// Runtime ID appears before the conversation ID; both are needed for
    /// conversation calls, the runtime ID alone suffices for teardown.
    runtime_id: RwLock<Option<String>>,
    ids: RwLock<Option<RemoteIds>>,
    status: Arc<RwLock<SessionStatus>>,
    event_log: Arc<EventLog>,
    /// Service-side event cursor; independent of local log sequences.
    remote_cursor: Arc<AtomicU64>,
    subscription_active: Arc<AtomicBool>,
    poll_cancel: CancellationToken,
}

impl RemoteBackend {
    pub fn new(
        key: SessionKey,
        config: RemoteBackendConfig,
        api: Arc<dyn RemoteApi>,
        workspace_path: PathBuf,
        credentials: Credentials,
        model: ModelConfig,
    ) -> Self {
        Self {
            key,
            config,
            api,
            workspace_path,
            credentials,
            model,
            runtime_id: RwLock::new(None),
            ids: RwLock::new(None),
            status: Arc::new(RwLock::new(SessionStatus::Provisioning)),
            event_log: Arc::new(EventLog::new()),
            remote_cursor: Arc::new(AtomicU64::new(0)),
            subscription_active: Arc::new(AtomicBool::new(false)),
            poll_cancel: CancellationToken::new(),
        }
    }

    /// Attach a bounded event channel fed by the subscription task.
    pub fn subscribe_events(&self, capacity: usize) -> tokio::sync::mpsc::Receiver<Event> {
        self.event_log.subscribe(capacity)
    }

    fn provisioning_error(&self, e: RemoteError) -> OrchestratorError {
        match e {
            RemoteError::Connection { message, url } => OrchestratorError::BackendUnavailable {
                backend: BackendKind::Remote,
                reason: format!("{}: {}", url, message),
            },
            other => OrchestratorError::ProvisioningFatal {
                backend: BackendKind::Remote,
                reason: other.to_string(),
            },
        }
    }

    fn map_wait_error(&self, e: WaitError) -> OrchestratorError {
        match e {
            WaitError::TimedOut { waited, .. } => OrchestratorError::ProvisioningTimeout {
                backend: BackendKind::Remote,
                waited,
            },
            WaitError::Fatal(reason) => OrchestratorError::ProvisioningFatal {
                backend: BackendKind::Remote,
                reason,
            },
            WaitError::Cancelled => OrchestratorError::Cancelled,
        }
    }

    /// Two-stage readiness: runtime-level health, then agent-level
    /// aliveness once the conversation exists. Each stage has its own
    /// budget, so the combined wait is bounded by their sum.
    async fn wait_for_runtime_ready_and_alive(
        &self,
        cancel: &CancellationToken,
        runtime_id: &str,
    ) -> OrchestratorResult<String> {
        let runtime_waiter =
            ReadinessWaiter::new(self.config.runtime_ready_timeout, self.config.check_interval);
        runtime_waiter
            .wait("hosted runtime", cancel, || {
                let api = self.api.clone();
                let runtime_id = runtime_id.to_string();
                async move {
                    match api.runtime_status(&runtime_id).await {
                        Ok(info) => match info.state {
                            RuntimeState::Ready => Readiness::Ready,
                            RuntimeState::Error => {
                                Readiness::Fatal("Runtime failed to start".to_string())
                            }
                            RuntimeState::Provisioning => Readiness::NotReady(
                                info.detail.unwrap_or_else(|| "provisioning".to_string()),
                            ),
                        },
                        Err(e) if e.is_retryable() => Readiness::NotReady(e.to_string()),
                        Err(e) => Readiness::Fatal(e.to_string()),
                    }
                }
            })
            .await
            .map_err(|e| self.map_wait_error(e))?;

        let conversation_id = self
            .api
            .create_conversation(
                runtime_id,
                CreateConversationRequest {
                    provider: self.model.provider.clone(),
                    model: self.model.model.clone(),
                    workspace_path: self.workspace_path.to_string_lossy().to_string(),
                    api_key: self.credentials.api_key.clone(),
                },
            )
            .await
            .map_err(|e| self.provisioning_error(e))?;

        let agent_waiter =
            ReadinessWaiter::new(self.config.agent_alive_timeout, self.config.check_interval);
        agent_waiter
            .wait("hosted agent", cancel, || {
                let api = self.api.clone();
                let runtime_id = runtime_id.to_string();
                let conversation_id = conversation_id.clone();
                async move {
                    match api.conversation_status(&runtime_id, &conversation_id).await {
                        Ok(info) => match info.agent_state {
                            AgentState::Running | AgentState::Paused | AgentState::Completed => {
                                Readiness::Ready
                            }
                            AgentState::Starting => Readiness::NotReady(
                                info.detail.unwrap_or_else(|| "starting".to_string()),
                            ),
                            AgentState::Error => Readiness::Fatal(
                                info.detail
                                    .unwrap_or_else(|| "Agent failed to start".to_string()),
                            ),
                        },
                        Err(e) if e.is_retryable() => Readiness::NotReady(e.to_string()),
                        Err(e) => Readiness::Fatal(e.to_string()),
                    }
                }
            })
            .await
            .map_err(|e| self.map_wait_error(e))?;

        Ok(conversation_id)
    }

    fn ingest(&self, events: &[RemoteEvent]) {
        for remote_event in events {
            self.event_log.append(
                EventKind::from_wire(&remote_event.kind),
                remote_event.payload.clone(),
            );
            self.remote_cursor
                .fetch_max(remote_event.seq, Ordering::SeqCst);
        }
    }

    /// Background task keeping the event log populated from the hosted
    /// event endpoint.
    fn spawn_event_subscription(&self, ids: RemoteIds) {
        let api = self.api.clone();
        let log = self.event_log.clone();
        let status = self.status.clone();
        let cursor = self.remote_cursor.clone();
        let cancel = self.poll_cancel.clone();
        let interval = self.config.event_poll_interval;
        let limit = self.config.event_fetch_limit;
        let key = self.key.clone();

        self.subscription_active.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let since = cursor.load(Ordering::SeqCst);
                let events = match api
                    .fetch_events(&ids.runtime_id, &ids.conversation_id, since, limit)
                    .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        debug!("event fetch for {} skipped a poll: {}", key, e);
                        continue;
                    }
                };

                let mut completed = false;
                for remote_event in &events {
                    let kind = EventKind::from_wire(&remote_event.kind);
                    completed |= kind == EventKind::Completed;
                    log.append(kind, remote_event.payload.clone());
                    cursor.fetch_max(remote_event.seq, Ordering::SeqCst);
                }

                if completed {
                    let mut status = status.write().await;
                    if !status.is_terminal() {
                        *status = SessionStatus::Completed;
                    }
                    break;
                }
            }
            debug!("event subscription for {} stopped", key);
        });
    }

    async fn require_ids(&self, operation: &str) -> OrchestratorResult<RemoteIds> {
        self.ids.read().await.clone().ok_or_else(|| {
            OrchestratorError::transient(operation, "session has no hosted conversation")
        })
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
impl RuntimeBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn start(&self, cancel: &CancellationToken) -> OrchestratorResult<()> {
        let runtime_id = self
            .api
            .create_runtime()
            .await
            .map_err(|e| self.provisioning_error(e))?;
        // recorded immediately so a failed start can still deprovision
        *self.runtime_id.write().await = Some(runtime_id.clone());
        info!("session {} provisioning hosted runtime {}", self.key, runtime_id);

        let conversation_id = match self
            .wait_for_runtime_ready_and_alive(cancel, &runtime_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.set_status(SessionStatus::Error).await;
                return Err(e);
            }
        };

        let ids = RemoteIds {
            runtime_id,
            conversation_id,
        };
        *self.ids.write().await = Some(ids.clone());

        self.set_status(SessionStatus::Running).await;
        self.event_log.append(
            EventKind::StatusChange,
            serde_json::json!({ "status": "running", "backend": "remote" }),
        );
        if self.config.subscribe {
            self.spawn_event_subscription(ids);
        }
        Ok(())
    }

    async fn send_message(&self, text: &str, run: bool) -> OrchestratorResult<MessageAck> {
        let ids = self.require_ids("send_message").await?;
        let response = self
            .api
            .post_message(
                &ids.runtime_id,
                &ids.conversation_id,
                PostMessageRequest {
                    text: text.to_string(),
                    run,
                },
            )
            .await
            .map_err(|e| OrchestratorError::transient("send_message", e))?;

        Ok(MessageAck {
            key: self.key.clone(),
            accepted: response.accepted,
        })
    }

    async fn pause(&self) -> OrchestratorResult<bool> {
        let ids = self.require_ids("pause").await?;
        let response = self
            .api
            .pause(&ids.runtime_id, &ids.conversation_id)
            .await
            .map_err(|e| OrchestratorError::transient("pause", e))?;
        if response.accepted {
            self.set_status(SessionStatus::Paused).await;
        }
        Ok(response.accepted)
    }

    async fn resume(&self) -> OrchestratorResult<bool> {
        let ids = self.require_ids("resume").await?;
        let response = self
            .api
            .resume(&ids.runtime_id, &ids.conversation_id)
            .await
            .map_err(|e| OrchestratorError::transient("resume", e))?;
        if response.accepted {
            self.set_status(SessionStatus::Running).await;
        }
        Ok(response.accepted)
    }

    async fn status(&self) -> OrchestratorResult<StatusSnapshot> {
        let stored = *self.status.read().await;
        let ids = self.ids.read().await.clone();

        let status = match (ids, stored) {
            (_, s) if s.is_terminal() => s,
            (Some(ids), s) => {
                match self
                    .api
                    .conversation_status(&ids.runtime_id, &ids.conversation_id)
                    .await
                {
                    Ok(info) => {
                        let reported = match info.agent_state {
                            AgentState::Starting => SessionStatus::Provisioning,
                            AgentState::Running => SessionStatus::Running,
                            AgentState::Paused => SessionStatus::Paused,
                            AgentState::Completed => SessionStatus::Completed,
                            AgentState::Error => SessionStatus::Error,
                        };
                        if reported != s {
                            self.set_status(reported).await;
                        }
                        reported
                    }
                    // service hiccup: report what we knew
                    Err(_) => s,
                }
            }
            (None, s) => s,
        };

        Ok(StatusSnapshot {
            key: self.key.clone(),
            backend: BackendKind::Remote,
            status,
            last_event_seq: self.event_log.last_seq(),
        })
    }

    async fn events_since(&self, since: u64) -> OrchestratorResult<Vec<Event>> {
        // With a live subscription the log is already being filled; without
        // one, pull-fetch and append before serving.
        if !self.subscription_active.load(Ordering::SeqCst) {
            if let Some(ids) = self.ids.read().await.clone() {
                let cursor = self.remote_cursor.load(Ordering::SeqCst);
                match self
                    .api
                    .fetch_events(
                        &ids.runtime_id,
                        &ids.conversation_id,
                        cursor,
                        self.config.event_fetch_limit,
                    )
                    .await
                {
                    Ok(events) => self.ingest(&events),
                    Err(e) => {
                        return Err(OrchestratorError::transient("events", e));
                    }
                }
            }
        }
        Ok(self.event_log.events_since(since))
    }

    async fn cleanup(&self) -> OrchestratorResult<()> {
        self.poll_cancel.cancel();
        self.subscription_active.store(false, Ordering::SeqCst);

        let ids = self.ids.write().await.take();
        let runtime_id = self.runtime_id.write().await.take();

        if let Some(ids) = &ids {
            if let Err(e) = self
                .api
                .delete_conversation(&ids.runtime_id, &ids.conversation_id)
                .await
            {
                warn!("deprovisioning conversation for {} failed: {}", self.key, e);
            }
        }
        if let Some(runtime_id) = runtime_id {
            if let Err(e) = self.api.delete_runtime(&runtime_id).await {
                warn!("deprovisioning runtime for {} failed: {}", self.key, e);
            } else {
                info!("session {} hosted runtime {} released", self.key, runtime_id);
            }
        }

        self.set_status(SessionStatus::Completed).await;
        Ok(())
    }
}
