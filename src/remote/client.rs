//! Hosted runtime HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};

use super::types::*;

/// Hosted execution service operations used by the remote backend.
///
/// Trait-shaped so tests can substitute a mock service.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Lightweight service health probe.
    async fn health(&self) -> RemoteResult<()>;

    async fn create_runtime(&self) -> RemoteResult<String>;
    async fn runtime_status(&self, runtime_id: &str) -> RemoteResult<RuntimeInfo>;
    async fn delete_runtime(&self, runtime_id: &str) -> RemoteResult<()>;

    async fn create_conversation(
        &self,
        runtime_id: &str,
        request: CreateConversationRequest,
    ) -> RemoteResult<String>;
    async fn conversation_status(
        &self,
        runtime_id: &str,
        conversation_id: &str,
    ) -> RemoteResult<ConversationInfo>;
    async fn delete_conversation(
        &self,
        runtime_id: &str,
        conversation_id: &str,
    ) -> RemoteResult<()>;

    async fn post_message(
        &self,
        runtime_id: &str,
        conversation_id: &str,
        request: PostMessageRequest,
    ) -> RemoteResult<AcceptedResponse>;
    async fn pause(&self, runtime_id: &str, conversation_id: &str)
        -> RemoteResult<AcceptedResponse>;
    async fn resume(
        &self,
        runtime_id: &str,
        conversation_id: &str,
    ) -> RemoteResult<AcceptedResponse>;

    /// Fetch events after the service-side cursor `since`, at most `limit`.
    async fn fetch_events(
        &self,
        runtime_id: &str,
        conversation_id: &str,
        since: u64,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteEvent>>;
}

/// Client for the hosted execution service.
#[derive(Debug, Clone)]
pub struct HostedRuntimeClient {
    client: Client,
    base_url: String,
    api_key: String,
    /// Attempts per idempotent call (first try included).
    max_attempts: u32,
    retry_backoff: Duration,
}

impl HostedRuntimeClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> RemoteResult<Self> {
        let base_url = base_url.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Connection {
                url: base_url.clone(),
                message: format!("building HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn connection_error(&self, url: &str, e: reqwest::Error) -> RemoteError {
        RemoteError::Connection {
            url: url.to_string(),
            message: e.to_string(),
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> RemoteResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| RemoteError::Parse(e.to_string()));
        }
        Err(Self::classify(status, response).await)
    }

    async fn handle_empty(response: reqwest::Response) -> RemoteResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Self::classify(status, response).await)
    }

    async fn classify(status: StatusCode, response: reqwest::Response) -> RemoteError {
        let message = match response.json::<ApiErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
        };
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
            StatusCode::NOT_FOUND => RemoteError::NotFound(message),
            s if s.is_client_error() => RemoteError::CallerError {
                status: s.as_u16(),
                message,
            },
            s => RemoteError::ServerError {
                status: s.as_u16(),
                message,
            },
        }
    }

    /// Bounded retry with backoff for idempotent calls.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> RemoteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = RemoteResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let backoff = self.retry_backoff * attempt;
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation, attempt, self.max_attempts, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;
        Self::handle_response(response).await
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> RemoteResult<T> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;
        Self::handle_response(response).await
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        let url = self.url(path);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;
        Self::handle_empty(response).await
    }
}

#[async_trait]
impl RemoteApi for HostedRuntimeClient {
    async fn health(&self) -> RemoteResult<()> {
        let url = self.url("/health");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.connection_error(&url, e))?;
        Self::handle_empty(response).await
    }

    async fn create_runtime(&self) -> RemoteResult<String> {
        let created: CreatedResponse = self
            .post_json("/v1/runtimes", &serde_json::json!({}))
            .await?;
        debug!("created hosted runtime {}", created.id);
        Ok(created.id)
    }

    async fn runtime_status(&self, runtime_id: &str) -> RemoteResult<RuntimeInfo> {
        let path = format!("/v1/runtimes/{}", runtime_id);
        self.with_retry("runtime_status", || self.get_json(&path))
            .await
    }

    async fn delete_runtime(&self, runtime_id: &str) -> RemoteResult<()> {
        let path = format!("/v1/runtimes/{}", runtime_id);
        self.with_retry("delete_runtime", || self.delete(&path))
            .await
    }

    async fn create_conversation(
        &self,
        runtime_id: &str,
        request: CreateConversationRequest,
    ) -> RemoteResult<String> {
        let path = format!("/v1/runtimes/{}/conversations", runtime_id);
        let created: CreatedResponse = self.post_json(&path, &request).await?;
        Ok(created.id)
    }

    async fn conversation_status(
        &self,
        runtime_id: &str,
        conversation_id: &str,
    ) -> RemoteResult<ConversationInfo> {
        let path = format!(
            "/v1/runtimes/{}/conversations/{}",
            runtime_id, conversation_id
        );
        self.with_retry("conversation_status", || self.get_json(&path))
            .await
    }

    async fn delete_conversation(
        &self,
        runtime_id: &str,
        conversation_id: &str,
    ) -> RemoteResult<()> {
        let path = format!(
            "/v1/runtimes/{}/conversations/{}",
            runtime_id, conversation_id
        );
        self.with_retry("delete_conversation", || self.delete(&path))
            .await
    }

    async fn post_message(
        &self,
        runtime_id: &str,
        conversation_id: &str,
        request: PostMessageRequest,
    ) -> RemoteResult<AcceptedResponse> {
        let path = format!(
            "/v1/runtimes/{}/conversations/{}/messages",
            runtime_id, conversation_id
        );
        // not retried: message ingestion is not idempotent
        self.post_json(&path, &request).await
    }

    async fn pause(
        &self,
        runtime_id: &str,
        conversation_id: &str,
    ) -> RemoteResult<AcceptedResponse> {
        let path = format!(
            "/v1/runtimes/{}/conversations/{}/pause",
            runtime_id, conversation_id
        );
        self.post_json(&path, &serde_json::json!({})).await
    }

    async fn resume(
        &self,
        runtime_id: &str,
        conversation_id: &str,
    ) -> RemoteResult<AcceptedResponse> {
        let path = format!(
            "/v1/runtimes/{}/conversations/{}/resume",
            runtime_id, conversation_id
        );
        self.post_json(&path, &serde_json::json!({})).await
    }

    async fn fetch_events(
        &self,
        runtime_id: &str,
        conversation_id: &str,
        since: u64,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteEvent>> {
        let path = format!(
            "/v1/runtimes/{}/conversations/{}/events?since={}&limit={}",
            runtime_id, conversation_id, since, limit
        );
        let response: EventsResponse =
            self.with_retry("fetch_events", || self.get_json(&path)).await?;
        Ok(response.events)
    }
}
