//! Telemetry collection for the dispatch path

use chrono::{DateTime, Utc};
use relay_core::{DispatchFailureReason, FailureKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Types of telemetry events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Agent answered, possibly after retries
    AgentSucceeded {
        agent_id: String,
        calls: u32,
        latency_ms: u64,
    },
    /// Agent gave up after its retry budget or a permanent error
    AgentFailed {
        agent_id: String,
        kind: FailureKind,
        calls: u32,
    },
    /// Agent passed over without a network call
    BreakerSkipped { agent_id: String },
    /// Circuit opened for the agent
    BreakerOpened { agent_id: String },
    /// Circuit closed again after a successful probe
    BreakerClosed { agent_id: String },
    /// A dispatch finished with a response
    DispatchSucceeded { latency_ms: u64 },
    /// A dispatch finished without a response
    DispatchFailed { reason: DispatchFailureReason },
    /// Response served from cache
    CacheHit,
    /// Request joined an identical in-flight request
    Coalesced,
    /// Retrieval failed and the task was sent without context
    RetrievalDegraded,
}

/// Collected telemetry for one agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Network calls made, retries included
    pub calls: u64,
    pub successes: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub breaker_skips: u64,
    pub breaker_opens: u64,
    /// Sum of successful call latencies
    pub total_latency_ms: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl AgentMetrics {
    /// Share of settled attempts that succeeded
    pub fn success_rate(&self) -> f32 {
        let settled = self.successes + self.transient_failures + self.permanent_failures;
        if settled == 0 {
            return 1.0;
        }
        self.successes as f32 / settled as f32
    }

    pub fn mean_latency_ms(&self) -> Option<u64> {
        (self.successes > 0).then(|| self.total_latency_ms / self.successes)
    }
}

/// Metrics collector for the dispatcher
pub struct MetricsCollector {
    /// Metrics by agent ID
    agents: Arc<RwLock<HashMap<String, AgentMetrics>>>,
    /// Dispatch failures by reason
    failure_reasons: Arc<RwLock<BTreeMap<String, u64>>>,
    /// Global counters
    dispatches: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    retrieval_degraded: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            failure_reasons: Arc::new(RwLock::new(BTreeMap::new())),
            dispatches: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            retrieval_degraded: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
        }
    }

    /// Record an event
    pub async fn record(&self, event: TelemetryEvent) {
        debug!(?event, "Telemetry");
        match event {
            TelemetryEvent::AgentSucceeded {
                agent_id,
                calls,
                latency_ms,
            } => {
                self.with_agent(&agent_id, |m| {
                    m.calls += u64::from(calls);
                    m.successes += 1;
                    // Earlier calls in the same run failed transiently
                    m.transient_failures += u64::from(calls.saturating_sub(1));
                    m.total_latency_ms += latency_ms;
                    m.last_success_at = Some(Utc::now());
                })
                .await;
            }
            TelemetryEvent::AgentFailed {
                agent_id,
                kind,
                calls,
            } => {
                self.with_agent(&agent_id, |m| {
                    m.calls += u64::from(calls);
                    match kind {
                        FailureKind::Transient => m.transient_failures += u64::from(calls),
                        FailureKind::Permanent => {
                            m.permanent_failures += 1;
                            m.transient_failures += u64::from(calls.saturating_sub(1));
                        }
                    }
                    m.last_failure_at = Some(Utc::now());
                })
                .await;
            }
            TelemetryEvent::BreakerSkipped { agent_id } => {
                self.with_agent(&agent_id, |m| m.breaker_skips += 1).await;
            }
            TelemetryEvent::BreakerOpened { agent_id } => {
                self.with_agent(&agent_id, |m| m.breaker_opens += 1).await;
            }
            TelemetryEvent::BreakerClosed { .. } => {}
            TelemetryEvent::DispatchSucceeded { latency_ms } => {
                self.dispatches.fetch_add(1, Ordering::Relaxed);
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
            }
            TelemetryEvent::DispatchFailed { reason } => {
                self.dispatches.fetch_add(1, Ordering::Relaxed);
                self.failures.fetch_add(1, Ordering::Relaxed);
                let mut reasons = self.failure_reasons.write().await;
                *reasons.entry(reason.to_string()).or_insert(0) += 1;
            }
            TelemetryEvent::CacheHit => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::Coalesced => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::RetrievalDegraded => {
                self.retrieval_degraded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn with_agent(&self, agent_id: &str, update: impl FnOnce(&mut AgentMetrics)) {
        let mut agents = self.agents.write().await;
        update(agents.entry(agent_id.to_string()).or_default());
    }

    /// Get metrics for an agent
    pub async fn agent_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        let agents = self.agents.read().await;
        agents.get(agent_id).cloned()
    }

    /// Get global summary
    pub fn global_summary(&self) -> GlobalMetrics {
        GlobalMetrics {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            retrieval_degraded: self.retrieval_degraded.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
        }
    }

    /// Everything collected so far
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let agents = self.agents.read().await;
        let failure_reasons = self.failure_reasons.read().await;
        MetricsSnapshot {
            taken_at: Utc::now(),
            global: self.global_summary(),
            failure_reasons: failure_reasons.clone(),
            agents: agents
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub dispatches: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub retrieval_degraded: u64,
    pub total_latency_ms: u64,
}

impl GlobalMetrics {
    pub fn success_rate(&self) -> f32 {
        if self.dispatches == 0 {
            return 1.0;
        }
        self.successes as f32 / self.dispatches as f32
    }
}

/// Point-in-time view served by `GET /metrics`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub global: GlobalMetrics,
    pub failure_reasons: BTreeMap<String, u64>,
    /// Ordered by agent id
    pub agents: BTreeMap<String, AgentMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_counters() {
        let collector = MetricsCollector::new();

        collector
            .record(TelemetryEvent::AgentFailed {
                agent_id: "primary".to_string(),
                kind: FailureKind::Transient,
                calls: 3,
            })
            .await;
        collector
            .record(TelemetryEvent::AgentSucceeded {
                agent_id: "backup".to_string(),
                calls: 2,
                latency_ms: 40,
            })
            .await;
        collector
            .record(TelemetryEvent::BreakerSkipped {
                agent_id: "primary".to_string(),
            })
            .await;

        let primary = collector.agent_metrics("primary").await.unwrap();
        assert_eq!(primary.calls, 3);
        assert_eq!(primary.transient_failures, 3);
        assert_eq!(primary.breaker_skips, 1);
        assert_eq!(primary.success_rate(), 0.0);

        let backup = collector.agent_metrics("backup").await.unwrap();
        assert_eq!(backup.successes, 1);
        assert_eq!(backup.transient_failures, 1);
        assert_eq!(backup.mean_latency_ms(), Some(40));
        assert_eq!(backup.success_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_global_summary() {
        let collector = MetricsCollector::new();

        collector
            .record(TelemetryEvent::DispatchSucceeded { latency_ms: 10 })
            .await;
        collector.record(TelemetryEvent::CacheHit).await;
        collector
            .record(TelemetryEvent::DispatchFailed {
                reason: DispatchFailureReason::Exhausted,
            })
            .await;

        let global = collector.global_summary();
        assert_eq!(global.dispatches, 2);
        assert_eq!(global.cache_hits, 1);
        assert_eq!(global.success_rate(), 0.5);

        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.failure_reasons.get("exhausted"), Some(&1));
    }

    #[test]
    fn test_event_serialization() {
        let value = serde_json::to_value(TelemetryEvent::BreakerSkipped {
            agent_id: "a".to_string(),
        })
        .unwrap();
        assert_eq!(value["event"], "breaker_skipped");
    }
}
