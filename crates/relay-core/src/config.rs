//! Configuration management for relay
//!
//! Agents and tunables are supplied as static configuration at startup,
//! loaded from a TOML file (`relay.toml` by default). Every section has
//! defaults so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::{AgentDescriptor, Budgets, Health, MetadataFilter, RelayError, Result, RiskTier};

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Default budgets for every outbound call
    #[serde(default)]
    pub budgets: BudgetConfig,

    /// Static agent catalog
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    /// Per task-type settings
    #[serde(default)]
    pub task_types: HashMap<String, TaskTypeConfig>,
}

/// Inbound HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// Retry engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the delay randomized in both directions
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

/// Circuit breaker tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Cap for the reset timeout after repeated failed probes
    #[serde(default = "default_max_reset_timeout_ms")]
    pub max_reset_timeout_ms: u64,
}

/// Hybrid retriever tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Reciprocal rank fusion constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,

    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,

    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,

    /// When set, documents at or below this cosine similarity are left out
    /// of the semantic list. Unset ranks every candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_similarity: Option<f64>,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

/// Out-of-band health probing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

/// Default outbound budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_max_time_ms")]
    pub max_time_ms: u64,
}

/// Static agent entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub tier: u32,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_risk_tier: RiskTier,
    pub endpoint: String,
}

/// Per task-type settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTypeConfig {
    /// Attach retrieved documents before dispatch
    #[serde(default)]
    pub retrieval: Option<RetrievalNeed>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub max_time_ms: Option<u64>,
}

/// Retrieval requirement of a task type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalNeed {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub filters: Vec<MetadataFilter>,
}

// Default value providers
fn default_bind() -> String {
    "127.0.0.1:7171".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_jitter_fraction() -> f64 {
    0.2
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_max_reset_timeout_ms() -> u64 {
    300_000
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_bm25_k1() -> f64 {
    1.2
}

fn default_bm25_b() -> f64 {
    0.75
}

fn default_top_k() -> usize {
    5
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_health_interval_secs() -> u64 {
    15
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_time_ms() -> u64 {
    10_000
}

impl RelayConfig {
    /// Load configuration from `path` or use defaults when the file is missing
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate configuration from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(RelayError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(RelayError::Config(format!(
                "retry.jitter_fraction must be within [0, 1], got {}",
                self.retry.jitter_fraction
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(RelayError::Config(format!(
                "retry.max_delay_ms ({}) must not be below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(RelayError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if !(self.retrieval.rrf_k.is_finite() && self.retrieval.rrf_k > 0.0) {
            return Err(RelayError::Config(format!(
                "retrieval.rrf_k must be a positive number, got {}",
                self.retrieval.rrf_k
            )));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(RelayError::DuplicateAgent(agent.id.clone()));
            }
            if agent.capabilities.is_empty() {
                return Err(RelayError::Config(format!(
                    "agent {} declares no capabilities",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    /// Budgets for a task type, falling back to the defaults
    pub fn budgets_for(&self, task_type: &str) -> Budgets {
        let overrides = self.task_types.get(task_type);
        Budgets {
            max_tokens: overrides
                .and_then(|t| t.max_tokens)
                .unwrap_or(self.budgets.max_tokens),
            max_time_ms: overrides
                .and_then(|t| t.max_time_ms)
                .unwrap_or(self.budgets.max_time_ms),
        }
    }

    /// Retrieval requirement declared for a task type, if any
    pub fn retrieval_need(&self, task_type: &str) -> Option<&RetrievalNeed> {
        self.task_types.get(task_type).and_then(|t| t.retrieval.as_ref())
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn max_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.max_reset_timeout_ms.max(self.reset_timeout_ms))
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl From<&AgentConfig> for AgentDescriptor {
    fn from(config: &AgentConfig) -> Self {
        Self {
            id: config.id.clone(),
            tier: config.tier,
            capabilities: config.capabilities.iter().cloned().collect::<BTreeSet<_>>(),
            max_risk_tier: config.max_risk_tier,
            endpoint: config.endpoint.clone(),
            health: Health::Healthy,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            max_reset_timeout_ms: default_max_reset_timeout_ms(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            min_similarity: None,
            default_top_k: default_top_k(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval_secs(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_time_ms: default_max_time_ms(),
        }
    }
}
