//! Agent registry and fallback chain selection

use relay_core::{
    AgentDescriptor, DispatchFailureReason, Health, RelayConfig, RelayError, Result, RiskTier,
};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info};

/// Why no fallback chain could be built
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct SelectionError {
    pub reason: DispatchFailureReason,
    pub message: String,
}

impl SelectionError {
    fn new(reason: DispatchFailureReason, message: String) -> Self {
        Self { reason, message }
    }
}

/// Catalog of agents known to this process
///
/// Agents are added at startup or through [`AgentRegistry::register`] and
/// never removed. Only their health changes.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, AgentDescriptor>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let registry = Self::new();
        for agent in &config.agents {
            registry.register(AgentDescriptor::from(agent))?;
        }
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, AgentDescriptor>> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, AgentDescriptor>> {
        self.agents.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an agent; ids must be unique
    pub fn register(&self, agent: AgentDescriptor) -> Result<()> {
        let mut agents = self.write();
        if agents.contains_key(&agent.id) {
            return Err(RelayError::DuplicateAgent(agent.id));
        }
        info!(
            agent = %agent.id,
            tier = agent.tier,
            max_risk_tier = %agent.max_risk_tier,
            "Registered agent"
        );
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.read().get(agent_id).cloned()
    }

    /// Every agent, ordered by id
    pub fn all(&self) -> Vec<AgentDescriptor> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Update an agent's health, returning the previous value
    pub fn set_health(&self, agent_id: &str, health: Health) -> Result<Health> {
        let mut agents = self.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| RelayError::AgentNotFound(agent_id.to_string()))?;
        let previous = std::mem::replace(&mut agent.health, health);
        if previous != health {
            debug!(agent = agent_id, ?previous, ?health, "Agent health changed");
        }
        Ok(previous)
    }

    /// Agents eligible for a task, in the order they should be tried
    ///
    /// Capability and risk tier are checked before health, so the error
    /// names the first constraint nobody satisfies. The chain is sorted by
    /// tier, then id.
    pub fn fallback_chain(
        &self,
        task_type: &str,
        risk_tier: RiskTier,
    ) -> std::result::Result<Vec<AgentDescriptor>, SelectionError> {
        let agents = self.read();

        let capable: Vec<&AgentDescriptor> =
            agents.values().filter(|a| a.can_handle(task_type)).collect();
        if capable.is_empty() {
            return Err(SelectionError::new(
                DispatchFailureReason::UnknownTaskType,
                format!("no agent handles task type '{}'", task_type),
            ));
        }

        let trusted: Vec<&AgentDescriptor> = capable
            .into_iter()
            .filter(|a| a.may_serve(risk_tier))
            .collect();
        if trusted.is_empty() {
            return Err(SelectionError::new(
                DispatchFailureReason::RiskTierViolation,
                format!(
                    "no agent handling '{}' may serve risk tier {}",
                    task_type, risk_tier
                ),
            ));
        }

        let mut chain: Vec<AgentDescriptor> = trusted
            .into_iter()
            .filter(|a| a.health.is_eligible())
            .cloned()
            .collect();
        if chain.is_empty() {
            return Err(SelectionError::new(
                DispatchFailureReason::NoEligibleAgent,
                format!("every agent for '{}' at {} is unavailable", task_type, risk_tier),
            ));
        }

        chain.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.id.cmp(&b.id)));
        Ok(chain)
    }
}
