//! Outbound agent transport
//!
//! Every agent speaks the same contract regardless of what it does:
//! `POST {endpoint}/execute` and `GET {endpoint}/health`.

use async_trait::async_trait;
use relay_core::{AgentCallError, AgentDescriptor};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::types::{ErrorReply, ExecuteReply, ExecuteRequest};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait for calling agents (allows mocking in tests)
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Execute a task on the agent and return its result payload
    async fn execute(
        &self,
        agent: &AgentDescriptor,
        request: &ExecuteRequest,
    ) -> Result<serde_json::Value, AgentCallError>;

    /// Liveness probe
    async fn health(&self, agent: &AgentDescriptor) -> Result<(), AgentCallError>;
}

/// HTTP/JSON transport
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(agent: &AgentDescriptor, path: &str) -> String {
        format!("{}/{}", agent.endpoint.trim_end_matches('/'), path)
    }
}

/// Classify a reqwest failure
fn classify(err: reqwest::Error, budget: Duration) -> AgentCallError {
    if err.is_timeout() {
        AgentCallError::Timeout { budget }
    } else if err.is_decode() {
        AgentCallError::Malformed {
            message: err.to_string(),
        }
    } else {
        AgentCallError::Connection {
            message: err.to_string(),
        }
    }
}

/// Turn a non-success HTTP reply into an error, honoring the agent's own classification
fn error_from_body(status: u16, body: &str) -> AgentCallError {
    match serde_json::from_str::<ErrorReply>(body) {
        Ok(reply) => AgentCallError::Reported {
            kind: reply.error.kind,
            message: reply.error.message,
        },
        Err(_) => AgentCallError::from_status(status, body.trim()),
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    #[instrument(skip(self, agent, request), fields(agent = %agent.id, request_id = %request.request_id))]
    async fn execute(
        &self,
        agent: &AgentDescriptor,
        request: &ExecuteRequest,
    ) -> Result<serde_json::Value, AgentCallError> {
        let budget = request.budgets.max_time();
        let response = self
            .client
            .post(Self::url(agent, "execute"))
            .timeout(budget)
            .json(request)
            .send()
            .await
            .map_err(|e| classify(e, budget))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| classify(e, budget))?;

        if !status.is_success() {
            debug!("Agent returned {}: {}", status, body);
            return Err(error_from_body(status.as_u16(), &body));
        }

        // A 200 can still carry a typed error
        if let Ok(reply) = serde_json::from_str::<ErrorReply>(&body) {
            return Err(AgentCallError::Reported {
                kind: reply.error.kind,
                message: reply.error.message,
            });
        }

        serde_json::from_str::<ExecuteReply>(&body)
            .map(|reply| reply.result)
            .map_err(|e| AgentCallError::Malformed {
                message: format!("Failed to parse agent reply: {}", e),
            })
    }

    #[instrument(skip(self, agent), fields(agent = %agent.id))]
    async fn health(&self, agent: &AgentDescriptor) -> Result<(), AgentCallError> {
        let response = self
            .client
            .get(Self::url(agent, "health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify(e, HEALTH_TIMEOUT))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AgentCallError::from_status(
                status.as_u16(),
                format!("health probe returned {}", status),
            ))
        }
    }
}
