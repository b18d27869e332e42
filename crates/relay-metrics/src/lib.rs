//! # relay-metrics
//!
//! Telemetry for the dispatch path.
//!
//! This crate provides:
//! - Per-agent call counters and latency
//! - Global dispatch counters (outcomes, cache hits, coalesced followers)
//! - A serializable snapshot for the introspection endpoint

mod collector;

pub use collector::{AgentMetrics, GlobalMetrics, MetricsCollector, MetricsSnapshot, TelemetryEvent};
