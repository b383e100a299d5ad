//! The agent collaborator boundary.
//!
//! ACTION steps are opaque remote calls to an agent capability. The engine
//! only sees the request/response contract defined here and talks to agents
//! through the `AgentClient` trait, so registries, HTTP transports, and test
//! doubles plug in the same way.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkflowError};

/// A request for an agent to perform one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub request_id: String,
    pub user_id: String,
    /// Deadline in seconds the engine enforces on this call.
    pub timeout_secs: u64,
}

/// An agent's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
    pub agent_id: String,
    pub request_id: String,
    /// Time the agent spent, in milliseconds.
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AgentResponse {
    /// A successful response carrying `data`.
    pub fn ok(request: &AgentRequest, data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            agent_id: request.agent_id.clone(),
            request_id: request.request_id.clone(),
            execution_time_ms: 0,
            timestamp: Utc::now(),
        }
    }

    /// A failed response carrying an error message.
    pub fn failed(request: &AgentRequest, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            agent_id: request.agent_id.clone(),
            request_id: request.request_id.clone(),
            execution_time_ms: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Something that can perform agent actions.
///
/// Implementations may observe `cancellation` to abandon work early when the
/// owning execution is cancelled. The engine never relies on it: once an
/// execution is cancelled, late responses are discarded.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Send a request and wait for the agent's response.
    ///
    /// An `Err` and a response with `success == false` are both treated as a
    /// retryable step failure.
    async fn send_request(
        &self,
        request: AgentRequest,
        cancellation: CancellationToken,
    ) -> Result<AgentResponse>;
}

/// Shared agent client handle.
pub type SharedAgentClient = Arc<dyn AgentClient>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock client
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted reply from `MockAgentClient`.
#[derive(Debug, Clone)]
pub struct MockReply {
    outcome: MockOutcome,
    delay: Duration,
}

#[derive(Debug, Clone)]
enum MockOutcome {
    Success(Value),
    Failure(String),
    TransportError(String),
    Echo,
}

impl MockReply {
    /// Succeed with `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            outcome: MockOutcome::Success(data),
            delay: Duration::ZERO,
        }
    }

    /// Respond with `success == false`.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            outcome: MockOutcome::Failure(error.into()),
            delay: Duration::ZERO,
        }
    }

    /// Fail to deliver a response at all.
    pub fn transport_error(error: impl Into<String>) -> Self {
        Self {
            outcome: MockOutcome::TransportError(error.into()),
            delay: Duration::ZERO,
        }
    }

    /// Succeed, echoing the request's action and parameters back.
    pub fn echo() -> Self {
        Self {
            outcome: MockOutcome::Echo,
            delay: Duration::ZERO,
        }
    }

    /// Wait `delay` before replying.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One call observed by `MockAgentClient`.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub request: AgentRequest,
    pub started: Instant,
    /// `None` while the call is in flight or if it was dropped.
    pub finished: Option<Instant>,
}

/// An in-memory agent that replays scripted replies.
///
/// Replies are queued per `(agent_id, action)` and consumed in order. When a
/// queue is empty, the fallback reply is used (echo by default).
pub struct MockAgentClient {
    scripts: Mutex<HashMap<(String, String), VecDeque<MockReply>>>,
    fallback: MockReply,
    calls: Mutex<Vec<MockCall>>,
}

impl Default for MockAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgentClient {
    /// A mock that echoes every request.
    pub fn new() -> Self {
        Self::with_fallback(MockReply::echo())
    }

    /// A mock that answers unscripted calls with `fallback`.
    pub fn with_fallback(fallback: MockReply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue replies for an agent action.
    pub fn script(
        self,
        agent_id: impl Into<String>,
        action: impl Into<String>,
        replies: impl IntoIterator<Item = MockReply>,
    ) -> Self {
        self.scripts
            .lock()
            .entry((agent_id.into(), action.into()))
            .or_default()
            .extend(replies);
        self
    }

    /// All calls made so far, in start order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Calls made for one action.
    pub fn calls_for(&self, action: &str) -> Vec<MockCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.request.action == action)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_reply(&self, request: &AgentRequest) -> MockReply {
        self.scripts
            .lock()
            .get_mut(&(request.agent_id.clone(), request.action.clone()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl AgentClient for MockAgentClient {
    async fn send_request(
        &self,
        request: AgentRequest,
        _cancellation: CancellationToken,
    ) -> Result<AgentResponse> {
        let reply = self.next_reply(&request);
        let index = {
            let mut calls = self.calls.lock();
            calls.push(MockCall {
                request: request.clone(),
                started: Instant::now(),
                finished: None,
            });
            calls.len() - 1
        };

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        if let Some(call) = self.calls.lock().get_mut(index) {
            call.finished = Some(Instant::now());
        }

        let elapsed_ms = reply.delay.as_millis() as u64;
        let response = match reply.outcome {
            MockOutcome::Success(data) => AgentResponse::ok(&request, data),
            MockOutcome::Failure(error) => AgentResponse::failed(&request, error),
            MockOutcome::TransportError(error) => return Err(WorkflowError::Agent(error)),
            MockOutcome::Echo => AgentResponse::ok(
                &request,
                serde_json::json!({
                    "agent": request.agent_id,
                    "action": request.action,
                    "parameters": request.parameters,
                }),
            ),
        };
        Ok(AgentResponse {
            execution_time_ms: elapsed_ms,
            ..response
        })
    }
}
