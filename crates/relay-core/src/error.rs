//! Unified error types for relay

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for all relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // Registry errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(String),

    // Dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Agent call failed: {0}")]
    AgentCall(#[from] AgentCallError),

    // Retrieval errors
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

/// Whether a failed agent call is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retried by the retry engine and counted by the circuit breaker
    Transient,
    /// Never retried, never counted against the agent
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure of a single call to a remote agent
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCallError {
    #[error("deadline of {}ms exceeded", .budget.as_millis())]
    Timeout { budget: Duration },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Agent reported a failure and classified it itself
    #[error("agent reported {kind} failure: {message}")]
    Reported { kind: FailureKind, message: String },

    #[error("payload rejected: {message}")]
    Rejected { message: String },

    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("task type not supported: {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("risk tier {requested} exceeds agent limit {allowed}")]
    RiskTierMismatch {
        requested: crate::RiskTier,
        allowed: crate::RiskTier,
    },

    #[error("malformed agent response: {message}")]
    Malformed { message: String },
}

impl AgentCallError {
    /// Classify the failure for retry and breaker purposes
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::RateLimited { .. }
            | Self::Server { .. } => FailureKind::Transient,
            Self::Reported { kind, .. } => *kind,
            Self::Rejected { .. }
            | Self::Client { .. }
            | Self::UnknownTaskType { .. }
            | Self::RiskTierMismatch { .. }
            | Self::Malformed { .. } => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Map an HTTP status from an agent to an error
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited { message },
            400 | 422 => Self::Rejected { message },
            s if s >= 500 => Self::Server { status: s, message },
            s => Self::Client { status: s, message },
        }
    }
}
