//! End-to-end orchestrator tests against stubbed execution environments.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use tether::engine::{ContainerSpec, EngineApi, EngineError, EngineResult};
use tether::remote::{
    AcceptedResponse, AgentState, ConversationInfo, CreateConversationRequest, PostMessageRequest,
    RemoteApi, RemoteError, RemoteEvent, RemoteResult, RuntimeInfo, RuntimeState,
};
use tether::{
    BackendKind, CreateSessionRequest, Credentials, EventKind, ModelConfig, Orchestrator,
    OrchestratorConfig, OrchestratorError, SessionKey,
};

/// Container engine stub: healthy by default, with switches for the two
/// failure modes the orchestrator reacts to.
struct StubEngine {
    ping_ok: AtomicBool,
    create_fails: AtomicBool,
    removed: Mutex<Vec<(String, bool)>>,
    execs: Mutex<Vec<Vec<String>>>,
}

impl StubEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ping_ok: AtomicBool::new(true),
            create_fails: AtomicBool::new(false),
            removed: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EngineApi for StubEngine {
    async fn ping(&self) -> EngineResult<()> {
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::EngineUnavailable(
                "docker daemon not running".to_string(),
            ))
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        if self.create_fails.load(Ordering::SeqCst) {
            return Err(EngineError::EngineUnavailable(
                "cannot connect to engine socket".to_string(),
            ));
        }
        Ok(format!("id-{}", spec.name))
    }

    async fn stop_container(&self, _id: &str, _timeout: Option<u32>) -> EngineResult<()> {
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        self.removed.lock().unwrap().push((id.to_string(), force));
        Ok(())
    }

    async fn pause_container(&self, _id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn unpause_container(&self, _id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn container_state_status(&self, _id: &str) -> EngineResult<Option<String>> {
        Ok(Some("running".to_string()))
    }

    async fn container_logs(&self, _id: &str, _tail: Option<u32>) -> EngineResult<String> {
        Ok(String::new())
    }

    async fn exec_detached(&self, _id: &str, command: &[&str]) -> EngineResult<()> {
        self.execs
            .lock()
            .unwrap()
            .push(command.iter().map(|s| s.to_string()).collect());
        Ok(())
    }

    async fn exec_output(&self, _id: &str, _command: &[&str]) -> EngineResult<String> {
        Ok(String::new())
    }
}

/// Hosted service stub: provisions instantly, serves scripted events.
struct StubRemote {
    unavailable: AtomicBool,
    conversations: Mutex<Vec<CreateConversationRequest>>,
    messages: Mutex<Vec<(String, bool)>>,
    events: Mutex<Vec<RemoteEvent>>,
}

impl StubRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            unavailable: AtomicBool::new(false),
            conversations: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        })
    }

    fn push_event(&self, seq: u64, kind: &str) {
        self.events.lock().unwrap().push(RemoteEvent {
            seq,
            kind: kind.to_string(),
            payload: serde_json::json!({}),
            timestamp: Utc::now(),
        });
    }

    fn connection_error(&self) -> RemoteError {
        RemoteError::Connection {
            url: "http://hosted.example".to_string(),
            message: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl RemoteApi for StubRemote {
    async fn health(&self) -> RemoteResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(self.connection_error());
        }
        Ok(())
    }

    async fn create_runtime(&self) -> RemoteResult<String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(self.connection_error());
        }
        Ok("rt-1".to_string())
    }

    async fn runtime_status(&self, runtime_id: &str) -> RemoteResult<RuntimeInfo> {
        Ok(RuntimeInfo {
            id: runtime_id.to_string(),
            state: RuntimeState::Ready,
            detail: None,
        })
    }

    async fn delete_runtime(&self, _runtime_id: &str) -> RemoteResult<()> {
        Ok(())
    }

    async fn create_conversation(
        &self,
        _runtime_id: &str,
        request: CreateConversationRequest,
    ) -> RemoteResult<String> {
        self.conversations.lock().unwrap().push(request);
        Ok("conv-1".to_string())
    }

    async fn conversation_status(
        &self,
        _runtime_id: &str,
        conversation_id: &str,
    ) -> RemoteResult<ConversationInfo> {
        Ok(ConversationInfo {
            id: conversation_id.to_string(),
            agent_state: AgentState::Running,
            detail: None,
        })
    }

    async fn delete_conversation(
        &self,
        _runtime_id: &str,
        _conversation_id: &str,
    ) -> RemoteResult<()> {
        Ok(())
    }

    async fn post_message(
        &self,
        _runtime_id: &str,
        _conversation_id: &str,
        request: PostMessageRequest,
    ) -> RemoteResult<AcceptedResponse> {
        self.messages
            .lock()
            .unwrap()
            .push((request.text, request.run));
        Ok(AcceptedResponse { accepted: true })
    }

    async fn pause(
        &self,
        _runtime_id: &str,
        _conversation_id: &str,
    ) -> RemoteResult<AcceptedResponse> {
        Ok(AcceptedResponse { accepted: true })
    }

    async fn resume(
        &self,
        _runtime_id: &str,
        _conversation_id: &str,
    ) -> RemoteResult<AcceptedResponse> {
        Ok(AcceptedResponse { accepted: true })
    }

    async fn fetch_events(
        &self,
        _runtime_id: &str,
        _conversation_id: &str,
        since: u64,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteEvent>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.seq > since)
            .take(limit)
            .cloned()
            .collect())
    }
}

fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.local.provision_timeout = Duration::from_millis(500);
    config.local.check_interval = Duration::from_millis(10);
    config.local.event_poll_interval = Duration::from_millis(10);
    config.remote.runtime_ready_timeout = Duration::from_millis(500);
    config.remote.agent_alive_timeout = Duration::from_millis(500);
    config.remote.check_interval = Duration::from_millis(10);
    config.remote.event_poll_interval = Duration::from_millis(10);
    config
}

fn orchestrator(engine: Arc<StubEngine>, remote: Arc<StubRemote>) -> Orchestrator {
    let _ = env_logger::builder().is_test(true).try_init();
    Orchestrator::new(fast_config(), engine, remote)
}

fn request(user: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        key: SessionKey::new(user, "shop", "main"),
        credentials: Credentials {
            api_key: Some("sk-test".to_string()),
            extra_env: HashMap::new(),
        },
        model: ModelConfig {
            provider: "anthropic".to_string(),
            model: "claude-sonnet".to_string(),
        },
        workspace_path: PathBuf::from("/tmp/ws"),
        subscribe_events: false,
    }
}

#[tokio::test]
async fn test_workspace_path_reaches_remote_conversation() {
    let workspace = tempfile::tempdir().unwrap();
    let engine = StubEngine::new();
    engine.ping_ok.store(false, Ordering::SeqCst);
    let remote = StubRemote::new();
    let orch = orchestrator(engine, remote.clone());
    orch.probe_local_availability().await;

    let mut req = request("alice");
    req.workspace_path = workspace.path().to_path_buf();
    let handle = orch.create_session(req).await.unwrap();
    assert_eq!(handle.backend, BackendKind::Remote);

    let conversations = remote.conversations.lock().unwrap();
    assert_eq!(
        conversations[0].workspace_path,
        workspace.path().to_string_lossy()
    );
    assert_eq!(conversations[0].provider, "anthropic");
    assert_eq!(conversations[0].api_key.as_deref(), Some("sk-test"));
}

#[tokio::test]
async fn test_failed_probe_routes_sessions_to_remote() {
    let engine = StubEngine::new();
    engine.ping_ok.store(false, Ordering::SeqCst);
    let remote = StubRemote::new();
    let orch = orchestrator(engine, remote);

    assert!(!orch.probe_local_availability().await);
    assert!(orch.probe_remote_availability().await);

    let handle = orch.create_session(request("alice")).await.unwrap();
    assert_eq!(handle.backend, BackendKind::Remote);

    let stats = orch.stats();
    assert_eq!(stats.mode, BackendKind::Remote);
    assert_eq!(stats.local_sessions, 0);
    assert_eq!(stats.remote_sessions, 1);
}

#[tokio::test]
async fn test_local_session_lifecycle() {
    let engine = StubEngine::new();
    let remote = StubRemote::new();
    let orch = orchestrator(engine.clone(), remote);
    assert!(orch.probe_local_availability().await);

    let req = request("alice");
    let key = req.key.clone();
    let handle = orch.create_session(req).await.unwrap();
    assert_eq!(handle.backend, BackendKind::Local);
    assert_eq!(orch.stats().local_sessions, 1);

    let ack = orch.send_message(&key, "hello agent").await.unwrap();
    assert!(ack.accepted);
    {
        let execs = engine.execs.lock().unwrap();
        assert_eq!(execs[0], vec!["tether-agent", "send", "hello agent"]);
    }

    assert!(orch.remove_session(&key).await);
    assert!(!orch.remove_session(&key).await);
    assert_eq!(orch.stats().local_sessions, 0);

    // cross-backend sweep force-removes the deterministic container name
    let removed = engine.removed.lock().unwrap();
    assert!(removed
        .iter()
        .any(|(id, force)| id == "tether-alice-shop-main" && *force));
}

#[tokio::test]
async fn test_duplicate_session_is_rejected() {
    let engine = StubEngine::new();
    let remote = StubRemote::new();
    let orch = orchestrator(engine, remote);
    orch.probe_local_availability().await;

    orch.create_session(request("alice")).await.unwrap();
    let err = orch.create_session(request("alice")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::DuplicateSession(_)));

    // a different user's key is unaffected
    orch.create_session(request("bob")).await.unwrap();
    assert_eq!(orch.stats().local_sessions, 2);
}

#[tokio::test]
async fn test_local_failure_during_create_fails_over_to_remote() {
    let engine = StubEngine::new();
    // probe passes, but container launch hits a dead engine socket
    engine.create_fails.store(true, Ordering::SeqCst);
    let remote = StubRemote::new();
    let orch = orchestrator(engine, remote);
    assert!(orch.probe_local_availability().await);

    let handle = orch.create_session(request("alice")).await.unwrap();
    assert_eq!(handle.backend, BackendKind::Remote);

    // the failure flips the preference; later sessions go straight remote
    assert_eq!(orch.stats().mode, BackendKind::Remote);
    let handle = orch.create_session(request("bob")).await.unwrap();
    assert_eq!(handle.backend, BackendKind::Remote);
    assert_eq!(orch.stats().remote_sessions, 2);
}

#[tokio::test]
async fn test_both_backends_down_surfaces_unavailable() {
    let engine = StubEngine::new();
    engine.ping_ok.store(false, Ordering::SeqCst);
    engine.create_fails.store(true, Ordering::SeqCst);
    let remote = StubRemote::new();
    remote.unavailable.store(true, Ordering::SeqCst);
    let orch = orchestrator(engine, remote);
    orch.probe_local_availability().await;
    assert!(!orch.probe_remote_availability().await);

    let err = orch.create_session(request("alice")).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::BackendUnavailable {
            backend: BackendKind::Remote,
            ..
        }
    ));

    // the failed create left nothing registered; the key is reusable
    let stats = orch.stats();
    assert_eq!(stats.local_sessions + stats.remote_sessions, 0);
}

#[tokio::test]
async fn test_remote_events_get_contiguous_local_sequences() {
    let engine = StubEngine::new();
    engine.ping_ok.store(false, Ordering::SeqCst);
    let remote = StubRemote::new();
    // service-side cursors are sparse on purpose
    remote.push_event(40, "message");
    remote.push_event(47, "tool_use");
    let orch = orchestrator(engine, remote.clone());
    orch.probe_local_availability().await;

    let req = request("alice");
    let key = req.key.clone();
    orch.create_session(req).await.unwrap();

    // seq 1 is the running status-change; pulled events follow without gaps
    let events = orch.events(&key, 0).await.unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(events[0].kind, EventKind::StatusChange);
    assert_eq!(events[1].kind, EventKind::AgentMessage);
    assert_eq!(events[2].kind, EventKind::ToolUse);

    // re-polling does not re-ingest already-seen service events
    let tail = orch.events(&key, 2).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].seq, 3);

    remote.push_event(52, "message");
    let newer = orch.events(&key, 3).await.unwrap();
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].seq, 4);
}

#[tokio::test]
async fn test_operations_on_unknown_key() {
    let engine = StubEngine::new();
    let remote = StubRemote::new();
    let orch = orchestrator(engine, remote);

    let key = SessionKey::new("ghost", "shop", "main");
    assert!(matches!(
        orch.send_message(&key, "hi").await.unwrap_err(),
        OrchestratorError::SessionNotFound(_)
    ));
    assert!(matches!(
        orch.status(&key).await.unwrap_err(),
        OrchestratorError::SessionNotFound(_)
    ));
    assert!(matches!(
        orch.events(&key, 0).await.unwrap_err(),
        OrchestratorError::SessionNotFound(_)
    ));
    assert!(!orch.remove_session(&key).await);
}

#[tokio::test]
async fn test_subscribed_handle_receives_events() {
    let engine = StubEngine::new();
    let remote = StubRemote::new();
    let orch = orchestrator(engine, remote);
    orch.probe_local_availability().await;

    let mut req = request("alice");
    req.subscribe_events = true;
    let key = req.key.clone();
    let handle = orch.create_session(req).await.unwrap();

    let mut rx = handle.events.expect("subscription requested");
    let first = rx.recv().await.unwrap();
    assert_eq!(first.seq, 1);
    assert_eq!(first.kind, EventKind::StatusChange);

    orch.remove_session(&key).await;
}

#[tokio::test]
async fn test_remote_message_forwards_run_flag() {
    let engine = StubEngine::new();
    engine.ping_ok.store(false, Ordering::SeqCst);
    let remote = StubRemote::new();
    let orch = orchestrator(engine, remote.clone());
    orch.probe_local_availability().await;

    let req = request("alice");
    let key = req.key.clone();
    orch.create_session(req).await.unwrap();

    orch.send_message(&key, "do the thing").await.unwrap();
    let messages = remote.messages.lock().unwrap();
    assert_eq!(messages[0], ("do the thing".to_string(), true));
}

#[tokio::test]
async fn test_retry_local_restores_local_preference() {
    let engine = StubEngine::new();
    engine.ping_ok.store(false, Ordering::SeqCst);
    let remote = StubRemote::new();
    let orch = orchestrator(engine.clone(), remote);
    orch.probe_local_availability().await;
    assert_eq!(orch.stats().mode, BackendKind::Remote);

    assert!(!orch.retry_local().await);
    engine.ping_ok.store(true, Ordering::SeqCst);
    assert!(orch.retry_local().await);
    assert_eq!(orch.stats().mode, BackendKind::Local);

    let handle = orch.create_session(request("alice")).await.unwrap();
    assert_eq!(handle.backend, BackendKind::Local);
}
