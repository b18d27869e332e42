//! Task dispatcher
//!
//! For every request: serve from cache if possible, otherwise join or start
//! a single in-flight run for the request identity. A run builds the
//! fallback chain, optionally attaches retrieval context, then walks the
//! chain through each agent's circuit breaker and the retry engine until
//! one agent answers or a permanent failure stops the walk.

use relay_agent::{
    call_with_retry, Admission, AgentTransport, BreakerRegistry, CallPermit, CircuitState,
    ExecuteRequest, Rejection, RetryPolicy,
};
use relay_core::fail_open::fail_open;
use relay_core::{
    AgentAttempt, AgentCallError, AgentDescriptor, AttemptStatus, ContextDocument, DedupKey,
    DispatchDecision, DispatchFailureReason, DispatchOutcome, Health, RelayConfig, RelayError,
    RetrievalResult, TaskRequest,
};
use relay_metrics::{MetricsCollector, TelemetryEvent};
use relay_retrieval::HybridRetriever;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CachedResponse, ResponseCache};
use crate::coalesce::Coalescer;
use crate::query::retrieval_query;
use crate::registry::{AgentRegistry, SelectionError};

/// Documents retrieved for one request
type RetrievalContext = (Vec<RetrievalResult>, Vec<ContextDocument>);

/// Routes tasks to agents
///
/// All shared state (registry, breakers, cache, metrics) is injected or
/// owned per instance; nothing is global.
pub struct Dispatcher {
    config: RelayConfig,
    registry: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    transport: Arc<dyn AgentTransport>,
    retriever: Option<Arc<HybridRetriever>>,
    metrics: Arc<MetricsCollector>,
    cache: ResponseCache,
    inflight: Coalescer<DedupKey, DispatchOutcome>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        config: RelayConfig,
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            breakers: Arc::new(BreakerRegistry::new(config.breaker.clone())),
            cache: ResponseCache::from_config(&config.cache),
            retry: RetryPolicy::from_config(&config.retry),
            metrics: Arc::new(MetricsCollector::new()),
            inflight: Coalescer::new(),
            retriever: None,
            config,
            registry,
            transport,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<HybridRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn retriever(&self) -> Option<&Arc<HybridRetriever>> {
        self.retriever.as_ref()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Dispatch a task and report exactly how it went
    ///
    /// Never fails: the outcome is either a response or the full list of
    /// agents considered and why each one did not answer.
    #[instrument(skip(self, request), fields(request_id = %request.request_id, task_type = %request.task_type))]
    pub async fn dispatch(&self, request: TaskRequest) -> DispatchOutcome {
        let key = request.dedup_key();

        if let Some(hit) = self.cache.get(&key) {
            return self.serve_cached(request.request_id, hit).await;
        }
        self.dispatch_coalesced(key, request).await
    }

    /// Join or lead the in-flight run for `key`
    ///
    /// The leader checks the cache again: a run for the same key may have
    /// finished between the caller's cache miss and joining the map.
    async fn dispatch_coalesced(&self, key: DedupKey, request: TaskRequest) -> DispatchOutcome {
        let request_id = request.request_id.clone();
        let (outcome, shared) = self
            .inflight
            .run(key.clone(), move || async move {
                match self.cache.get(&key) {
                    Some(hit) => self.serve_cached(request.request_id, hit).await,
                    None => self.dispatch_uncached(key, request).await,
                }
            })
            .await;

        if shared {
            debug!("Joined in-flight request");
            self.metrics.record(TelemetryEvent::Coalesced).await;
            outcome.for_request(&request_id, true)
        } else {
            outcome
        }
    }

    async fn serve_cached(&self, request_id: String, hit: CachedResponse) -> DispatchOutcome {
        debug!(agent = %hit.agent_id, "Cache hit");
        self.metrics.record(TelemetryEvent::CacheHit).await;
        self.metrics
            .record(TelemetryEvent::DispatchSucceeded { latency_ms: 0 })
            .await;
        DispatchOutcome::Success {
            request_id,
            agent_id: hit.agent_id,
            response: hit.response,
            latency_ms: 0,
            cached: true,
            coalesced: false,
            attempts: Vec::new(),
        }
    }

    /// Decisions the dispatcher would make, in chain order, without calling anyone
    pub async fn plan(
        &self,
        request: &TaskRequest,
    ) -> Result<Vec<DispatchDecision>, SelectionError> {
        let chain = self
            .registry
            .fallback_chain(&request.task_type, request.risk_tier)?;
        let budgets = self.config.budgets_for(&request.task_type);
        let plan = self
            .fetch_retrieval_context(request)
            .await
            .map(|(results, _)| results);

        Ok(chain
            .iter()
            .enumerate()
            .map(|(index, agent)| DispatchDecision {
                agent_id: agent.id.clone(),
                attempt_tier_index: index,
                retrieval_plan: plan.clone(),
                budgets,
            })
            .collect())
    }

    async fn dispatch_uncached(&self, key: DedupKey, request: TaskRequest) -> DispatchOutcome {
        let started = Instant::now();

        // Fail closed: nothing is sent anywhere unless a trusted chain exists
        let chain = match self
            .registry
            .fallback_chain(&request.task_type, request.risk_tier)
        {
            Ok(chain) => chain,
            Err(e) => {
                warn!(reason = %e.reason, "{}", e.message);
                return self
                    .fail(&request, e.reason, e.message, Vec::new())
                    .await;
            }
        };

        let budgets = self.config.budgets_for(&request.task_type);
        let (plan, context) = match self.retrieval_context(&request).await {
            Some((results, documents)) => (Some(results), Some(documents)),
            None => (None, None),
        };
        let execute = ExecuteRequest::from_task(&request, context, budgets);

        let mut attempts = Vec::with_capacity(chain.len());
        for (index, agent) in chain.iter().enumerate() {
            let permit = match self.breakers.get(&agent.id).try_acquire() {
                Admission::Granted(permit) => permit,
                Admission::Rejected(rejection) => {
                    debug!(agent = %agent.id, ?rejection, "Circuit breaker skip");
                    attempts.push(skipped(agent, rejection));
                    self.metrics
                        .record(TelemetryEvent::BreakerSkipped {
                            agent_id: agent.id.clone(),
                        })
                        .await;
                    continue;
                }
            };

            let decision = DispatchDecision {
                agent_id: agent.id.clone(),
                attempt_tier_index: index,
                retrieval_plan: plan.clone(),
                budgets,
            };
            debug!(
                agent = %decision.agent_id,
                index = decision.attempt_tier_index,
                probe = permit.is_probe(),
                context_docs = decision.retrieval_plan.as_ref().map_or(0, Vec::len),
                "Calling agent"
            );

            let call_started = Instant::now();
            let execute = &execute;
            let outcome =
                call_with_retry(&self.retry, move |_| self.call_agent(agent, execute)).await;
            let calls = outcome.calls();

            match outcome.result {
                Ok(response) => {
                    let latency_ms = call_started.elapsed().as_millis() as u64;
                    self.settle_success(agent, permit).await;
                    attempts.push(AgentAttempt {
                        agent_id: agent.id.clone(),
                        tier: agent.tier,
                        status: AttemptStatus::Succeeded { calls },
                    });
                    self.metrics
                        .record(TelemetryEvent::AgentSucceeded {
                            agent_id: agent.id.clone(),
                            calls,
                            latency_ms,
                        })
                        .await;

                    self.cache.insert(
                        key,
                        CachedResponse {
                            agent_id: agent.id.clone(),
                            response: response.clone(),
                        },
                    );

                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.metrics
                        .record(TelemetryEvent::DispatchSucceeded { latency_ms })
                        .await;
                    info!(agent = %agent.id, latency_ms, tried = attempts.len(), "Dispatched");

                    return DispatchOutcome::Success {
                        request_id: request.request_id,
                        agent_id: agent.id.clone(),
                        response,
                        latency_ms,
                        cached: false,
                        coalesced: false,
                        attempts,
                    };
                }
                Err(err) if err.is_transient() => {
                    warn!(agent = %agent.id, calls, error = %err, "Agent failed, falling back");
                    self.settle_failure(agent, permit).await;
                    attempts.push(failed(agent, &err, calls));
                    self.metrics
                        .record(TelemetryEvent::AgentFailed {
                            agent_id: agent.id.clone(),
                            kind: err.kind(),
                            calls,
                        })
                        .await;
                }
                Err(err) => {
                    // Not evidence of an unhealthy agent; the breaker is left as it was
                    permit.release();
                    warn!(agent = %agent.id, error = %err, "Agent rejected task");
                    attempts.push(failed(agent, &err, calls));
                    self.metrics
                        .record(TelemetryEvent::AgentFailed {
                            agent_id: agent.id.clone(),
                            kind: err.kind(),
                            calls,
                        })
                        .await;
                    let message = format!("agent {} rejected the task: {}", agent.id, err);
                    return self
                        .fail(&request, DispatchFailureReason::Rejected, message, attempts)
                        .await;
                }
            }
        }

        error!(
            agents = chain.len(),
            attempts = ?attempts,
            "Fallback chain exhausted"
        );
        let message = format!(
            "all {} agents for '{}' failed or were skipped",
            chain.len(),
            request.task_type
        );
        self.fail(&request, DispatchFailureReason::Exhausted, message, attempts)
            .await
    }

    /// One call with the hard per-attempt deadline; expiry is a transient failure
    async fn call_agent(
        &self,
        agent: &AgentDescriptor,
        request: &ExecuteRequest,
    ) -> Result<serde_json::Value, AgentCallError> {
        let budget = request.budgets.max_time();
        match tokio::time::timeout(budget, self.transport.execute(agent, request)).await {
            Ok(result) => result,
            Err(_) => Err(AgentCallError::Timeout { budget }),
        }
    }

    async fn settle_success(&self, agent: &AgentDescriptor, permit: CallPermit) {
        if permit.record_success() == Some(CircuitState::Closed) {
            info!(agent = %agent.id, "Circuit closed");
            self.update_health(&agent.id, Health::Healthy);
            self.metrics
                .record(TelemetryEvent::BreakerClosed {
                    agent_id: agent.id.clone(),
                })
                .await;
        }
    }

    async fn settle_failure(&self, agent: &AgentDescriptor, permit: CallPermit) {
        if permit.record_failure() == Some(CircuitState::Open) {
            warn!(agent = %agent.id, "Circuit opened");
            self.update_health(&agent.id, Health::Degraded);
            self.metrics
                .record(TelemetryEvent::BreakerOpened {
                    agent_id: agent.id.clone(),
                })
                .await;
        }
    }

    fn update_health(&self, agent_id: &str, health: Health) {
        if let Err(e) = self.registry.set_health(agent_id, health) {
            debug!(agent = agent_id, "Health update skipped: {}", e);
        }
    }

    /// Retrieved documents for the request, or `None` when the task type
    /// needs none or retrieval failed. Failures count as degraded dispatches.
    async fn retrieval_context(&self, request: &TaskRequest) -> Option<RetrievalContext> {
        self.config.retrieval_need(&request.task_type)?;

        let context = self.fetch_retrieval_context(request).await;
        match &context {
            Some((results, _)) => debug!(documents = results.len(), "Attached retrieval context"),
            None => self.metrics.record(TelemetryEvent::RetrievalDegraded).await,
        }
        context
    }

    /// Run the retrieval a task type asks for, without touching telemetry
    async fn fetch_retrieval_context(&self, request: &TaskRequest) -> Option<RetrievalContext> {
        let need = self.config.retrieval_need(&request.task_type)?;

        fail_open("retrieval", || async {
            let retriever = self.retriever.as_ref().ok_or_else(|| {
                RelayError::Retrieval("no retriever attached to the dispatcher".into())
            })?;
            let query = retrieval_query(&request.payload, need)?;
            Ok(retriever.retrieve_context(&query)?)
        })
        .await
    }

    async fn fail(
        &self,
        request: &TaskRequest,
        reason: DispatchFailureReason,
        message: String,
        attempts: Vec<AgentAttempt>,
    ) -> DispatchOutcome {
        self.metrics
            .record(TelemetryEvent::DispatchFailed { reason })
            .await;
        DispatchOutcome::Failure {
            request_id: request.request_id.clone(),
            reason,
            message,
            attempts,
        }
    }
}

fn skipped(agent: &AgentDescriptor, rejection: Rejection) -> AgentAttempt {
    let status = match rejection {
        Rejection::Open { retry_in } => AttemptStatus::SkippedCircuitOpen {
            retry_in_ms: retry_in.as_millis() as u64,
        },
        Rejection::ProbeInFlight => AttemptStatus::SkippedProbeInFlight,
    };
    AgentAttempt {
        agent_id: agent.id.clone(),
        tier: agent.tier,
        status,
    }
}

fn failed(agent: &AgentDescriptor, err: &AgentCallError, calls: u32) -> AgentAttempt {
    AgentAttempt {
        agent_id: agent.id.clone(),
        tier: agent.tier,
        status: AttemptStatus::Failed {
            kind: err.kind(),
            reason: err.to_string(),
            calls,
        },
    }
}
