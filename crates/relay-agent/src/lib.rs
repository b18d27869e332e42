//! # relay-agent
//!
//! Everything between the dispatcher and a remote agent:
//! - Uniform transport contract (`execute` / `health`) over HTTP
//! - Per-agent circuit breaker with single-probe half-open recovery
//! - Retry engine with exponential backoff, jitter and attempt history
//!
//! Agents are opaque. The only thing relay knows about a failure is its
//! [`FailureKind`](relay_core::FailureKind): transient failures are retried
//! and counted by the breaker, permanent ones are surfaced immediately.

mod circuit_breaker;
mod mock;
mod retry;
mod transport;
mod types;

pub use circuit_breaker::{
    Admission, BreakerRegistry, BreakerSnapshot, CallPermit, CircuitBreaker, CircuitState,
    Rejection,
};
pub use mock::{MockReply, MockTransport};
pub use retry::{call_with_retry, AttemptRecord, RetryOutcome, RetryPolicy};
pub use transport::{AgentTransport, HttpTransport};
pub use types::ExecuteRequest;
