//! Dispatcher behaviour against scripted agents

use relay_agent::{CircuitState, MockReply, MockTransport};
use relay_core::{
    AgentCallError, AgentDescriptor, AttemptStatus, DispatchFailureReason, DispatchOutcome,
    Document, FailureKind, Health, Mode, RelayConfig, RetrievalConfig, RetrievalNeed, RiskTier,
    TaskRequest, TaskTypeConfig,
};
use relay_dispatch::{AgentRegistry, Dispatcher};
use relay_retrieval::HybridRetriever;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const TASK: &str = "summarize";

fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.retry.jitter_fraction = 0.0;
    config.breaker.failure_threshold = 3;
    config.breaker.reset_timeout_ms = 1_000;
    config
}

fn agent(id: &str, tier: u32, max_risk_tier: RiskTier) -> AgentDescriptor {
    AgentDescriptor::new(id, tier, format!("mock://{}", id))
        .with_capability(TASK)
        .with_max_risk_tier(max_risk_tier)
}

fn dispatcher(config: RelayConfig, agents: Vec<AgentDescriptor>, mock: &MockTransport) -> Dispatcher {
    let registry = AgentRegistry::new();
    for agent in agents {
        registry.register(agent).unwrap();
    }
    Dispatcher::new(config, Arc::new(registry), Arc::new(mock.clone()))
}

fn task(payload: Value, request_id: &str) -> TaskRequest {
    TaskRequest::new(TASK, RiskTier::NonSensitive, payload, request_id)
}

fn ok(label: &str) -> MockReply {
    MockReply::Ok(json!({ "summary": label }))
}

fn unavailable() -> MockReply {
    MockReply::Err(AgentCallError::Server {
        status: 503,
        message: "unavailable".to_string(),
    })
}

fn agent_ids(outcome: &DispatchOutcome) -> Vec<&str> {
    outcome.attempts().iter().map(|a| a.agent_id.as_str()).collect()
}

fn winner(outcome: &DispatchOutcome) -> &str {
    match outcome {
        DispatchOutcome::Success { agent_id, .. } => agent_id,
        DispatchOutcome::Failure { message, .. } => panic!("expected success, got: {}", message),
    }
}

fn failure_reason(outcome: &DispatchOutcome) -> DispatchFailureReason {
    match outcome {
        DispatchOutcome::Failure { reason, .. } => *reason,
        DispatchOutcome::Success { agent_id, .. } => panic!("expected failure, {} answered", agent_id),
    }
}

#[tokio::test]
async fn test_phi_task_fails_rather_than_reaching_untrusted_agent() {
    let mock = MockTransport::new().with_reply("cheap", ok("cheap"));
    let dispatcher = dispatcher(config(), vec![agent("cheap", 0, RiskTier::Sensitive)], &mock);

    let request = TaskRequest::new(TASK, RiskTier::Phi, json!({"text": "chart"}), "r1");
    let outcome = dispatcher.dispatch(request).await;

    assert_eq!(failure_reason(&outcome), DispatchFailureReason::RiskTierViolation);
    assert!(outcome.attempts().is_empty());
    assert_eq!(mock.total_calls(), 0);
}

#[tokio::test]
async fn test_phi_task_skips_untrusted_lower_tier() {
    let mock = MockTransport::new()
        .with_reply("cheap", ok("cheap"))
        .with_reply("vault", ok("vault"));
    let dispatcher = dispatcher(
        config(),
        vec![
            agent("cheap", 0, RiskTier::Sensitive),
            agent("vault", 1, RiskTier::Phi),
        ],
        &mock,
    );

    let request = TaskRequest::new(TASK, RiskTier::Phi, json!({"text": "chart"}), "r1");
    let outcome = dispatcher.dispatch(request).await;

    assert_eq!(winner(&outcome), "vault");
    assert_eq!(mock.calls("cheap"), 0);
}

#[tokio::test]
async fn test_unknown_task_type() {
    let mock = MockTransport::new();
    let dispatcher = dispatcher(config(), vec![agent("a", 0, RiskTier::Phi)], &mock);

    let request = TaskRequest::new("translate", RiskTier::NonSensitive, json!({}), "r1");
    let outcome = dispatcher.dispatch(request).await;

    assert_eq!(failure_reason(&outcome), DispatchFailureReason::UnknownTaskType);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_chain_lists_every_agent_in_tier_order() {
    let mock = MockTransport::new()
        .with_reply("a", unavailable())
        .with_reply("b", unavailable())
        .with_reply("c", unavailable());
    let dispatcher = dispatcher(
        config(),
        vec![
            agent("c", 2, RiskTier::Phi),
            agent("a", 0, RiskTier::Phi),
            agent("b", 1, RiskTier::Phi),
        ],
        &mock,
    );

    let outcome = dispatcher.dispatch(task(json!({"text": "x"}), "r1")).await;

    assert_eq!(failure_reason(&outcome), DispatchFailureReason::Exhausted);
    assert_eq!(agent_ids(&outcome), vec!["a", "b", "c"]);
    for attempt in outcome.attempts() {
        assert!(matches!(
            attempt.status,
            AttemptStatus::Failed {
                kind: FailureKind::Transient,
                calls: 2,
                ..
            }
        ));
    }
    assert_eq!(mock.total_calls(), 6);

    let metrics = dispatcher.metrics().global_summary();
    assert_eq!(metrics.failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_skips_agent_without_a_call() {
    let mut config = config();
    config.retry.max_attempts = 1;
    let mock = MockTransport::new()
        .with_reply("a", unavailable())
        .with_reply("b", ok("b"));
    let dispatcher = dispatcher(
        config,
        vec![agent("a", 0, RiskTier::Phi), agent("b", 1, RiskTier::Phi)],
        &mock,
    );

    for n in 0..3 {
        let outcome = dispatcher.dispatch(task(json!({ "n": n }), "r")).await;
        assert_eq!(winner(&outcome), "b");
    }
    assert_eq!(mock.calls("a"), 3);
    assert_eq!(dispatcher.registry().get("a").unwrap().health, Health::Degraded);

    let outcome = dispatcher.dispatch(task(json!({ "n": 3 }), "r")).await;
    assert_eq!(winner(&outcome), "b");
    assert_eq!(mock.calls("a"), 3);
    assert!(matches!(
        outcome.attempts()[0].status,
        AttemptStatus::SkippedCircuitOpen { .. }
    ));

    let a = dispatcher.metrics().agent_metrics("a").await.unwrap();
    assert_eq!(a.breaker_skips, 1);
    assert_eq!(a.breaker_opens, 1);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_a_single_probe() {
    let mut config = config();
    config.retry.max_attempts = 1;
    config.breaker.failure_threshold = 1;
    let mock = MockTransport::new()
        .with_reply("a", ok("a"))
        .with_latency("a", Duration::from_millis(100))
        .with_reply("b", ok("b"));
    mock.push_reply("a", unavailable());
    let dispatcher = dispatcher(
        config,
        vec![agent("a", 0, RiskTier::Phi), agent("b", 1, RiskTier::Phi)],
        &mock,
    );

    let first = dispatcher.dispatch(task(json!({"n": 1}), "r1")).await;
    assert_eq!(winner(&first), "b");
    assert_eq!(dispatcher.breakers().get("a").state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1_000)).await;

    let (second, third) = tokio::join!(
        dispatcher.dispatch(task(json!({"n": 2}), "r2")),
        dispatcher.dispatch(task(json!({"n": 3}), "r3")),
    );

    // One probe on top of the original failure
    assert_eq!(mock.calls("a"), 2);
    let mut winners = vec![winner(&second), winner(&third)];
    winners.sort();
    assert_eq!(winners, vec!["a", "b"]);

    let fallback = if winner(&second) == "b" { &second } else { &third };
    assert_eq!(
        fallback.attempts()[0].status,
        AttemptStatus::SkippedProbeInFlight
    );

    assert_eq!(dispatcher.breakers().get("a").state(), CircuitState::Closed);
    assert_eq!(dispatcher.registry().get("a").unwrap().health, Health::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_identical_concurrent_requests_share_one_call() {
    let mock = MockTransport::new()
        .with_reply("a", ok("a"))
        .with_latency("a", Duration::from_millis(50));
    let dispatcher = dispatcher(config(), vec![agent("a", 0, RiskTier::Phi)], &mock);

    let payload = json!({"text": "discharge summary"});
    let (first, second) = tokio::join!(
        dispatcher.dispatch(task(payload.clone(), "r1")),
        dispatcher.dispatch(task(payload, "r2")),
    );

    assert_eq!(mock.calls("a"), 1);
    assert_eq!(first.request_id(), "r1");
    assert_eq!(second.request_id(), "r2");

    let coalesced: Vec<bool> = [&first, &second]
        .iter()
        .map(|o| matches!(o, DispatchOutcome::Success { coalesced: true, .. }))
        .collect();
    assert_eq!(coalesced.iter().filter(|c| **c).count(), 1);
    assert_eq!(dispatcher.metrics().global_summary().coalesced, 1);
}

#[tokio::test]
async fn test_cache_hit_skips_every_agent() {
    let mock = MockTransport::new().with_reply("a", ok("a"));
    let dispatcher = dispatcher(config(), vec![agent("a", 0, RiskTier::Phi)], &mock);
    let payload = json!({"text": "lab panel"});

    let first = dispatcher.dispatch(task(payload.clone(), "r1")).await;
    assert!(matches!(first, DispatchOutcome::Success { cached: false, .. }));

    let second = dispatcher.dispatch(task(payload.clone(), "r2")).await;
    assert!(matches!(second, DispatchOutcome::Success { cached: true, .. }));
    assert_eq!(second.request_id(), "r2");
    assert_eq!(mock.calls("a"), 1);

    // Demo traffic never reuses live responses
    let demo = task(payload, "r3").with_mode(Mode::Demo);
    let third = dispatcher.dispatch(demo).await;
    assert!(matches!(third, DispatchOutcome::Success { cached: false, .. }));
    assert_eq!(mock.calls("a"), 2);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let mock = MockTransport::new().with_reply("a", ok("a"));
    mock.push_reply(
        "a",
        MockReply::Err(AgentCallError::Rejected {
            message: "schema".to_string(),
        }),
    );
    let dispatcher = dispatcher(config(), vec![agent("a", 0, RiskTier::Phi)], &mock);
    let payload = json!({"text": "x"});

    let first = dispatcher.dispatch(task(payload.clone(), "r1")).await;
    assert!(!first.is_success());
    let second = dispatcher.dispatch(task(payload, "r2")).await;
    assert_eq!(winner(&second), "a");
}

#[tokio::test]
async fn test_permanent_failure_stops_the_chain() {
    let mut config = config();
    config.retry.max_attempts = 3;
    let mock = MockTransport::new()
        .with_reply(
            "a",
            MockReply::Err(AgentCallError::Rejected {
                message: "missing field".to_string(),
            }),
        )
        .with_reply("b", ok("b"));
    let dispatcher = dispatcher(
        config,
        vec![agent("a", 0, RiskTier::Phi), agent("b", 1, RiskTier::Phi)],
        &mock,
    );

    let outcome = dispatcher.dispatch(task(json!({"text": "x"}), "r1")).await;

    assert_eq!(failure_reason(&outcome), DispatchFailureReason::Rejected);
    assert_eq!(mock.calls("a"), 1);
    assert_eq!(mock.calls("b"), 0);
    assert_eq!(dispatcher.breakers().get("a").consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_expiry_counts_as_transient() {
    let mut config = config();
    config.task_types.insert(
        TASK.to_string(),
        TaskTypeConfig {
            retrieval: None,
            max_tokens: None,
            max_time_ms: Some(100),
        },
    );
    let mock = MockTransport::new()
        .with_reply("slow", MockReply::Hang)
        .with_reply("b", ok("b"));
    let dispatcher = dispatcher(
        config,
        vec![agent("slow", 0, RiskTier::Phi), agent("b", 1, RiskTier::Phi)],
        &mock,
    );

    let outcome = dispatcher.dispatch(task(json!({"text": "x"}), "r1")).await;

    assert_eq!(winner(&outcome), "b");
    assert_eq!(mock.calls("slow"), 2);
    assert!(matches!(
        &outcome.attempts()[0].status,
        AttemptStatus::Failed { kind: FailureKind::Transient, calls: 2, .. }
    ));
    assert_eq!(mock.requests()[0].1.budgets.max_time_ms, 100);
}

#[tokio::test]
async fn test_unavailable_agents_are_not_contacted() {
    let mock = MockTransport::new().with_reply("a", ok("a"));
    let dispatcher = dispatcher(config(), vec![agent("a", 0, RiskTier::Phi)], &mock);
    dispatcher
        .registry()
        .set_health("a", Health::Unavailable)
        .unwrap();

    let outcome = dispatcher.dispatch(task(json!({"text": "x"}), "r1")).await;

    assert_eq!(failure_reason(&outcome), DispatchFailureReason::NoEligibleAgent);
    assert_eq!(mock.total_calls(), 0);
}

fn retrieval_setup() -> (RelayConfig, Arc<HybridRetriever>) {
    let mut config = config();
    config.task_types.insert(
        TASK.to_string(),
        TaskTypeConfig {
            retrieval: Some(RetrievalNeed {
                top_k: 2,
                filters: Vec::new(),
            }),
            max_tokens: None,
            max_time_ms: None,
        },
    );

    let retriever = HybridRetriever::new(&RetrievalConfig::default());
    for (id, content, embedding) in [
        ("A", "hypertension treatment", vec![1.0, 0.0, 0.0]),
        ("B", "diabetes management", vec![0.0, 1.0, 0.0]),
        ("C", "hypertension and diabetes", vec![0.7, 0.7, 0.1]),
    ] {
        retriever.index(Document::new(id, content, embedding)).unwrap();
    }
    (config, Arc::new(retriever))
}

#[tokio::test]
async fn test_retrieval_context_travels_with_the_task() {
    let (config, retriever) = retrieval_setup();
    let mock = MockTransport::new().with_reply("a", ok("a"));
    let dispatcher = dispatcher(config, vec![agent("a", 0, RiskTier::Phi)], &mock)
        .with_retriever(retriever);

    let outcome = dispatcher
        .dispatch(task(json!({"query": "hypertension diabetes"}), "r1"))
        .await;
    assert!(outcome.is_success());

    let requests = mock.requests();
    let context = requests[0].1.retrieval_context.as_ref().unwrap();
    assert_eq!(context.len(), 2);
    assert_eq!(context[0].doc_id, "C");
    assert_eq!(context[0].content, "hypertension and diabetes");
}

#[tokio::test]
async fn test_retrieval_failure_degrades_to_no_context() {
    let (config, retriever) = retrieval_setup();
    let mock = MockTransport::new().with_reply("a", ok("a"));
    let dispatcher = dispatcher(config, vec![agent("a", 0, RiskTier::Phi)], &mock)
        .with_retriever(retriever);

    // Two-dimensional query against a three-dimensional index
    let payload = json!({"query": "hypertension", "query_embedding": [1.0, 0.0]});
    let outcome = dispatcher.dispatch(task(payload, "r1")).await;

    assert_eq!(winner(&outcome), "a");
    assert!(mock.requests()[0].1.retrieval_context.is_none());
    assert_eq!(dispatcher.metrics().global_summary().retrieval_degraded, 1);
}

#[tokio::test]
async fn test_plan_lists_chain_with_budgets() {
    let (config, retriever) = retrieval_setup();
    let mock = MockTransport::new();
    let dispatcher = dispatcher(
        config,
        vec![agent("b", 1, RiskTier::Phi), agent("a", 0, RiskTier::Phi)],
        &mock,
    )
    .with_retriever(retriever);

    let plan = dispatcher
        .plan(&task(json!({"query": "diabetes"}), "r1"))
        .await
        .unwrap();

    assert_eq!(plan.len(), 2);
    assert_eq!(plan[0].agent_id, "a");
    assert_eq!(plan[1].attempt_tier_index, 1);
    assert_eq!(plan[0].budgets.max_time_ms, 10_000);
    assert!(plan[0].retrieval_plan.is_some());
    assert_eq!(mock.total_calls(), 0);
}

#[tokio::test]
async fn test_plan_does_not_count_as_degraded_dispatch() {
    let (config, retriever) = retrieval_setup();
    let mock = MockTransport::new();
    let dispatcher = dispatcher(config, vec![agent("a", 0, RiskTier::Phi)], &mock)
        .with_retriever(retriever);

    let payload = json!({"query": "hypertension", "query_embedding": [1.0, 0.0]});
    let plan = dispatcher.plan(&task(payload, "r1")).await.unwrap();

    assert!(plan[0].retrieval_plan.is_none());
    let summary = dispatcher.metrics().global_summary();
    assert_eq!(summary.retrieval_degraded, 0);
    assert_eq!(summary.dispatches, 0);
}
