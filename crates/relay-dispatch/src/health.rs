//! Out-of-band agent health probing
//!
//! Runs beside the dispatch path, never inside it. A failed probe marks an
//! agent unavailable; a successful probe brings an unavailable agent back.
//! Degraded agents are left alone: their circuit breaker decides.

use futures::future::join_all;
use relay_agent::AgentTransport;
use relay_core::Health;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::AgentRegistry;

/// Health change applied by one probe round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub agent_id: String,
    pub from: Health,
    pub to: Health,
}

/// Periodic `GET /health` prober
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn AgentTransport>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>, transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// Probe every registered agent concurrently and apply the results
    pub async fn probe_once(&self) -> Vec<HealthTransition> {
        let agents = self.registry.all();
        let probes = agents.iter().map(|agent| async move {
            let result = self.transport.health(agent).await;
            (agent, result)
        });

        let mut transitions = Vec::new();
        for (agent, result) in join_all(probes).await {
            let target = match (&result, agent.health) {
                (Err(_), Health::Unavailable) => None,
                (Err(_), _) => Some(Health::Unavailable),
                (Ok(()), Health::Unavailable) => Some(Health::Healthy),
                (Ok(()), _) => None,
            };

            let Some(to) = target else {
                debug!(agent = %agent.id, health = %agent.health, "Health unchanged");
                continue;
            };

            match self.registry.set_health(&agent.id, to) {
                Ok(from) if from != to => {
                    match &result {
                        Err(e) => warn!(agent = %agent.id, error = %e, "Agent unavailable"),
                        Ok(()) => info!(agent = %agent.id, "Agent recovered"),
                    }
                    transitions.push(HealthTransition {
                        agent_id: agent.id.clone(),
                        from,
                        to,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(agent = %agent.id, "Failed to update health: {}", e),
            }
        }
        transitions
    }

    /// Probe on a fixed interval until the handle is aborted
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let transitions = self.probe_once().await;
                if !transitions.is_empty() {
                    debug!(changed = transitions.len(), "Health round applied changes");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_agent::MockTransport;
    use relay_core::AgentDescriptor;

    fn setup() -> (Arc<AgentRegistry>, MockTransport, HealthMonitor) {
        let registry = Arc::new(AgentRegistry::new());
        registry
            .register(AgentDescriptor::new("a", 0, "mock://a").with_capability("t"))
            .unwrap();
        registry
            .register(AgentDescriptor::new("b", 1, "mock://b").with_capability("t"))
            .unwrap();
        let mock = MockTransport::new();
        let monitor = HealthMonitor::new(registry.clone(), Arc::new(mock.clone()));
        (registry, mock, monitor)
    }

    #[tokio::test]
    async fn test_failed_probe_marks_unavailable() {
        let (registry, mock, monitor) = setup();
        mock.set_healthy("a", false);

        let transitions = monitor.probe_once().await;
        assert_eq!(
            transitions,
            vec![HealthTransition {
                agent_id: "a".to_string(),
                from: Health::Healthy,
                to: Health::Unavailable,
            }]
        );
        assert_eq!(registry.get("a").unwrap().health, Health::Unavailable);
        assert_eq!(registry.get("b").unwrap().health, Health::Healthy);

        // Already unavailable: no repeated transition
        assert!(monitor.probe_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_restores_eligibility() {
        let (registry, mock, monitor) = setup();
        registry.set_health("a", Health::Unavailable).unwrap();
        mock.set_healthy("a", true);

        let transitions = monitor.probe_once().await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(registry.get("a").unwrap().health, Health::Healthy);
    }

    #[tokio::test]
    async fn test_degraded_agent_left_to_breaker() {
        let (registry, _mock, monitor) = setup();
        registry.set_health("a", Health::Degraded).unwrap();

        assert!(monitor.probe_once().await.is_empty());
        assert_eq!(registry.get("a").unwrap().health, Health::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_probes_repeatedly() {
        let (_registry, mock, monitor) = setup();
        let handle = Arc::new(monitor).spawn(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.abort();

        // Ticks at 0s, 10s and 20s
        assert_eq!(mock.health_checks("a"), 3);
    }
}
