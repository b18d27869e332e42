//! Scripted agent transport for tests and demos

use async_trait::async_trait;
use relay_core::{AgentCallError, AgentDescriptor};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::transport::AgentTransport;
use crate::types::ExecuteRequest;

/// Canned reply for one execute call
#[derive(Debug, Clone)]
pub enum MockReply {
    Ok(serde_json::Value),
    Err(AgentCallError),
    /// Never answers; only a deadline ends the call
    Hang,
}

#[derive(Default)]
struct MockState {
    queued: HashMap<String, VecDeque<MockReply>>,
    fallback: HashMap<String, MockReply>,
    latency: HashMap<String, Duration>,
    unhealthy: HashMap<String, bool>,
    calls: HashMap<String, u32>,
    health_checks: HashMap<String, u32>,
    requests: Vec<(String, ExecuteRequest)>,
}

/// Mock agent transport
///
/// Queued replies are consumed first, then the agent's standing reply.
/// Agents with neither fail with a connection error.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reply used whenever no queued reply is left
    pub fn with_reply(self, agent_id: &str, reply: MockReply) -> Self {
        self.lock().fallback.insert(agent_id.to_string(), reply);
        self
    }

    /// Queue a one-shot reply
    pub fn push_reply(&self, agent_id: &str, reply: MockReply) {
        self.lock()
            .queued
            .entry(agent_id.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Delay every execute call to the agent
    pub fn with_latency(self, agent_id: &str, latency: Duration) -> Self {
        self.lock().latency.insert(agent_id.to_string(), latency);
        self
    }

    pub fn set_healthy(&self, agent_id: &str, healthy: bool) {
        self.lock().unhealthy.insert(agent_id.to_string(), !healthy);
    }

    /// Execute calls received by `agent_id`
    pub fn calls(&self, agent_id: &str) -> u32 {
        self.lock().calls.get(agent_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.lock().calls.values().sum()
    }

    pub fn health_checks(&self, agent_id: &str) -> u32 {
        self.lock().health_checks.get(agent_id).copied().unwrap_or(0)
    }

    /// Every execute request in arrival order, with the receiving agent id
    pub fn requests(&self) -> Vec<(String, ExecuteRequest)> {
        self.lock().requests.clone()
    }
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn execute(
        &self,
        agent: &AgentDescriptor,
        request: &ExecuteRequest,
    ) -> Result<serde_json::Value, AgentCallError> {
        let (reply, latency) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            *state.calls.entry(agent.id.clone()).or_default() += 1;
            state.requests.push((agent.id.clone(), request.clone()));

            let reply = state
                .queued
                .get_mut(&agent.id)
                .and_then(|q| q.pop_front())
                .or_else(|| state.fallback.get(&agent.id).cloned());
            (reply, state.latency.get(&agent.id).copied())
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match reply {
            Some(MockReply::Ok(value)) => Ok(value),
            Some(MockReply::Err(err)) => Err(err),
            Some(MockReply::Hang) => std::future::pending().await,
            None => Err(AgentCallError::Connection {
                message: format!("no reply scripted for {}", agent.id),
            }),
        }
    }

    async fn health(&self, agent: &AgentDescriptor) -> Result<(), AgentCallError> {
        let mut state = self.lock();
        *state.health_checks.entry(agent.id.clone()).or_default() += 1;
        if state.unhealthy.get(&agent.id).copied().unwrap_or(false) {
            Err(AgentCallError::Connection {
                message: format!("{} is down", agent.id),
            })
        } else {
            Ok(())
        }
    }
}
