//! HTTP client for the agent registry.
//!
//! Each ACTION step becomes one `POST <base_url>/agents/<agent_id>/requests`
//! carrying the `AgentRequest` as JSON; the body of a 2xx reply is decoded
//! as an `AgentResponse`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use weave_workflow::{AgentClient, AgentRequest, AgentResponse, WorkflowError};

/// Agent client backed by the registry's REST API.
pub struct HttpAgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAgentClient {
    /// Create a client for `base_url` with a per-request transport timeout.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn request_url(&self, agent_id: &str) -> String {
        format!("{}/agents/{}/requests", self.base_url, agent_id)
    }

    async fn post(&self, request: &AgentRequest) -> weave_workflow::Result<AgentResponse> {
        let url = self.request_url(&request.agent_id);
        debug!(url = %url, request_id = %request.request_id, "Posting agent request");

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| WorkflowError::Agent(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Agent(format!(
                "agent '{}' returned {}: {}",
                request.agent_id,
                status,
                body.trim()
            )));
        }

        response
            .json::<AgentResponse>()
            .await
            .map_err(|e| WorkflowError::Agent(format!("invalid agent response: {}", e)))
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn send_request(
        &self,
        request: AgentRequest,
        cancellation: CancellationToken,
    ) -> weave_workflow::Result<AgentResponse> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(WorkflowError::Agent("request cancelled".to_string())),
            response = self.post(&request) => response,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
