//! Hosted execution service client.
//!
//! HTTP access to the remote runtime provider: runtime provisioning,
//! conversation control, message posting, and event fetching.

mod client;
mod types;

pub use client::{HostedRuntimeClient, RemoteApi};
pub use types::{
    AcceptedResponse, AgentState, ApiErrorBody, ConversationInfo, CreateConversationRequest,
    CreatedResponse, EventsResponse, PostMessageRequest, RemoteError, RemoteEvent, RemoteResult,
    RuntimeInfo, RuntimeState,
};
