//! Core type definitions for relay dispatch and retrieval

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::FailureKind;

/// Sensitivity classification of a task (ordered)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    #[default]
    NonSensitive,
    Sensitive,
    Phi,
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonSensitive => write!(f, "non_sensitive"),
            Self::Sensitive => write!(f, "sensitive"),
            Self::Phi => write!(f, "phi"),
        }
    }
}

impl std::str::FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "non_sensitive" | "nonsensitive" | "non-sensitive" => Ok(Self::NonSensitive),
            "sensitive" => Ok(Self::Sensitive),
            "phi" => Ok(Self::Phi),
            _ => Err(format!("Invalid risk tier: {}", s)),
        }
    }
}

/// Execution mode of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Demo,
    #[default]
    Live,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "demo"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Agent health as seen by the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Healthy,
    Degraded,
    Unavailable,
}

impl Health {
    /// Whether the agent may appear in a fallback chain
    pub fn is_eligible(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Catalog entry for a remote worker agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent identifier
    pub id: String,
    /// Preference rank, lower tiers are tried first
    pub tier: u32,
    /// Task types this agent can execute (exact match)
    pub capabilities: BTreeSet<String>,
    /// Most sensitive risk tier the agent may serve
    pub max_risk_tier: RiskTier,
    /// Base URL of the agent
    pub endpoint: String,
    #[serde(default)]
    pub health: Health,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, tier: u32, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier,
            capabilities: BTreeSet::new(),
            max_risk_tier: RiskTier::NonSensitive,
            endpoint: endpoint.into(),
            health: Health::Healthy,
        }
    }

    pub fn with_capability(mut self, task_type: impl Into<String>) -> Self {
        self.capabilities.insert(task_type.into());
        self
    }

    pub fn with_max_risk_tier(mut self, tier: RiskTier) -> Self {
        self.max_risk_tier = tier;
        self
    }

    pub fn can_handle(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }

    /// Whether this agent is trusted with the given risk tier
    pub fn may_serve(&self, risk_tier: RiskTier) -> bool {
        self.max_risk_tier >= risk_tier
    }
}

/// Inbound task to be dispatched to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub risk_tier: RiskTier,
    #[serde(default)]
    pub mode: Mode,
    /// Opaque task payload forwarded to the agent
    pub payload: serde_json::Value,
    /// Idempotency key
    pub request_id: String,
}

impl TaskRequest {
    pub fn new(
        task_type: impl Into<String>,
        risk_tier: RiskTier,
        payload: serde_json::Value,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            risk_tier,
            mode: Mode::default(),
            payload,
            request_id: request_id.into(),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// SHA-256 of the canonical JSON payload, hex encoded
    pub fn payload_hash(&self) -> String {
        // serde_json maps are key-sorted, so serialization is canonical
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Key shared by the response cache and the request coalescer
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            task_type: self.task_type.clone(),
            risk_tier: self.risk_tier,
            mode: self.mode,
            payload_hash: self.payload_hash(),
        }
    }
}

/// Identity of a request for caching and coalescing
///
/// Responses are never shared across risk tiers or modes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub task_type: String,
    pub risk_tier: RiskTier,
    pub mode: Mode,
    pub payload_hash: String,
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = self.payload_hash.get(..12).unwrap_or(&self.payload_hash);
        write!(f, "{}/{}/{}/{}", self.task_type, self.risk_tier, self.mode, short)
    }
}

/// Resource limits for one outbound agent call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    pub max_tokens: u32,
    pub max_time_ms: u64,
}

impl Budgets {
    pub fn max_time(&self) -> Duration {
        Duration::from_millis(self.max_time_ms)
    }
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            max_time_ms: 10_000,
        }
    }
}

/// Routing decision for one position in the fallback chain (logged, not stored)
#[derive(Debug, Clone, Serialize)]
pub struct DispatchDecision {
    pub agent_id: String,
    pub attempt_tier_index: usize,
    pub retrieval_plan: Option<Vec<RetrievalResult>>,
    pub budgets: Budgets,
}

/// Document handed over by the ingestion collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(doc_id: impl Into<String>, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            doc_id: doc_id.into(),
            content: content.into(),
            embedding,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Metadata constraint applied before scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataFilter {
    /// Metadata value must equal `value`
    Eq {
        key: String,
        value: serde_json::Value,
    },
    /// Numeric metadata value within inclusive bounds
    Range {
        key: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

impl MetadataFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn range(key: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self::Range {
            key: key.into(),
            min,
            max,
        }
    }

    pub fn matches(&self, metadata: &BTreeMap<String, serde_json::Value>) -> bool {
        match self {
            Self::Eq { key, value } => metadata.get(key) == Some(value),
            Self::Range { key, min, max } => {
                let Some(n) = metadata.get(key).and_then(|v| v.as_f64()) else {
                    return false;
                };
                min.map_or(true, |lo| n >= lo) && max.map_or(true, |hi| n <= hi)
            }
        }
    }
}

/// Ranked retrieval query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalQuery {
    /// Text for lexical scoring
    #[serde(default)]
    pub text: Option<String>,
    /// Vector for semantic scoring
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Conjunction of constraints
    #[serde(default)]
    pub filters: Vec<MetadataFilter>,
}

impl RetrievalQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// One ranked retrieval hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub doc_id: String,
    pub fused_score: f64,
    /// BM25 score, absent when the document had no term overlap
    pub lexical_score: Option<f64>,
    /// Cosine similarity, absent when not semantically ranked
    pub semantic_score: Option<f64>,
    /// 1-based position in the fused ordering
    pub rank: usize,
}

/// Retrieved document attached to an outbound call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub doc_id: String,
    pub rank: usize,
    pub fused_score: f64,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// How one agent in the fallback chain fared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded {
        calls: u32,
    },
    Failed {
        kind: FailureKind,
        reason: String,
        calls: u32,
    },
    /// Breaker open, no network call made
    SkippedCircuitOpen {
        retry_in_ms: u64,
    },
    /// Another caller holds the half-open probe
    SkippedProbeInFlight,
}

/// Entry in the per-request attempt log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAttempt {
    pub agent_id: String,
    pub tier: u32,
    #[serde(flatten)]
    pub status: AttemptStatus,
}

/// Why no response could be obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchFailureReason {
    /// No registered agent declares the task type
    UnknownTaskType,
    /// Capable agents exist but none is trusted with the risk tier
    RiskTierViolation,
    /// Capable, trusted agents are all unavailable
    NoEligibleAgent,
    /// An agent rejected the request permanently
    Rejected,
    /// Every agent in the fallback chain failed or was skipped
    Exhausted,
}

impl std::fmt::Display for DispatchFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTaskType => write!(f, "unknown_task_type"),
            Self::RiskTierViolation => write!(f, "risk_tier_violation"),
            Self::NoEligibleAgent => write!(f, "no_eligible_agent"),
            Self::Rejected => write!(f, "rejected"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Result of dispatching one task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success {
        request_id: String,
        agent_id: String,
        response: serde_json::Value,
        latency_ms: u64,
        /// Served from the response cache
        #[serde(default)]
        cached: bool,
        /// Result shared from a concurrent identical request
        #[serde(default)]
        coalesced: bool,
        attempts: Vec<AgentAttempt>,
    },
    Failure {
        request_id: String,
        reason: DispatchFailureReason,
        message: String,
        attempts: Vec<AgentAttempt>,
    },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn attempts(&self) -> &[AgentAttempt] {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => attempts,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Failure { request_id, .. } => request_id,
        }
    }

    /// Re-label a shared outcome for a follower request
    pub fn for_request(mut self, id: &str, coalesced_follower: bool) -> Self {
        match &mut self {
            Self::Success {
                request_id,
                coalesced,
                ..
            } => {
                *request_id = id.to_string();
                *coalesced = coalesced_follower;
            }
            Self::Failure { request_id, .. } => *request_id = id.to_string(),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_risk_tier_ordering() {
        assert!(RiskTier::NonSensitive < RiskTier::Sensitive);
        assert!(RiskTier::Sensitive < RiskTier::Phi);
        assert_eq!("PHI".parse::<RiskTier>().unwrap(), RiskTier::Phi);
    }

    #[test]
    fn test_may_serve() {
        let agent = AgentDescriptor::new("a", 0, "http://a").with_max_risk_tier(RiskTier::Sensitive);
        assert!(agent.may_serve(RiskTier::NonSensitive));
        assert!(agent.may_serve(RiskTier::Sensitive));
        assert!(!agent.may_serve(RiskTier::Phi));
    }

    #[test]
    fn test_payload_hash_ignores_key_order() {
        let a = TaskRequest::new("t", RiskTier::NonSensitive, json!({"x": 1, "y": 2}), "r1");
        let b = TaskRequest::new("t", RiskTier::NonSensitive, json!({"y": 2, "x": 1}), "r2");
        assert_eq!(a.payload_hash(), b.payload_hash());
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_dedup_key_separates_modes() {
        let live = TaskRequest::new("t", RiskTier::NonSensitive, json!({}), "r");
        let demo = live.clone().with_mode(Mode::Demo);
        assert_ne!(live.dedup_key(), demo.dedup_key());

        let phi = TaskRequest::new("t", RiskTier::Phi, json!({}), "r");
        assert_ne!(live.dedup_key(), phi.dedup_key());
    }

    #[test]
    fn test_metadata_filters() {
        let doc = Document::new("d", "text", vec![1.0])
            .with_metadata("source", "lab")
            .with_metadata("year", 2021);

        assert!(MetadataFilter::eq("source", "lab").matches(&doc.metadata));
        assert!(!MetadataFilter::eq("source", "claims").matches(&doc.metadata));
        assert!(MetadataFilter::range("year", Some(2020.0), None).matches(&doc.metadata));
        assert!(!MetadataFilter::range("year", None, Some(2020.0)).matches(&doc.metadata));
        assert!(!MetadataFilter::range("missing", None, None).matches(&doc.metadata));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = DispatchOutcome::Failure {
            request_id: "r1".to_string(),
            reason: DispatchFailureReason::Exhausted,
            message: "all agents failed".to_string(),
            attempts: vec![AgentAttempt {
                agent_id: "a".to_string(),
                tier: 0,
                status: AttemptStatus::SkippedProbeInFlight,
            }],
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "failure");
        assert_eq!(value["reason"], "exhausted");
        assert_eq!(value["attempts"][0]["status"], "skipped_probe_in_flight");
    }
}
