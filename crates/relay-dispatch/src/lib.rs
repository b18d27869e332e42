//! # relay-dispatch
//!
//! Decides which agent handles each task and survives the ones that fail.
//!
//! This crate provides:
//! - Agent registry with tier-ordered, risk-filtered fallback chains
//! - The task dispatcher (breaker admission, retries, fallback, retrieval context)
//! - TTL response cache and single-flight coalescing of identical requests
//! - Out-of-band health monitor

mod cache;
mod coalesce;
mod dispatcher;
mod health;
mod query;
mod registry;

pub use cache::{CachedResponse, ResponseCache};
pub use coalesce::Coalescer;
pub use dispatcher::Dispatcher;
pub use health::{HealthMonitor, HealthTransition};
pub use query::retrieval_query;
pub use registry::{AgentRegistry, SelectionError};
