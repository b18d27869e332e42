//! # relay-core
//!
//! Core types for the relay agent dispatch and hybrid retrieval core.
//!
//! Relay sits between a document-processing application and a fleet of
//! opaque worker agents. For every inbound task it picks an agent from a
//! tier-ordered fallback chain, never letting a sensitive task reach an
//! agent that is not trusted with it, and optionally attaches documents
//! retrieved by fusing lexical and semantic rankings.
//!
//! ## Layout
//!
//! - `types`: agents, tasks, documents, dispatch outcomes
//! - [`config`]: TOML configuration loaded at startup
//! - `error`: unified error type plus the typed agent-call failure
//! - [`fail_open`]: helpers for work that may degrade instead of failing

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{
    AgentConfig, BreakerConfig, BudgetConfig, CacheConfig, HealthConfig, RelayConfig,
    RetrievalConfig, RetrievalNeed, RetryConfig, ServerConfig, TaskTypeConfig,
};
pub use error::{AgentCallError, FailureKind, RelayError, Result};
pub use types::*;
