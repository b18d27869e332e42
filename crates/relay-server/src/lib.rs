//! # relay-server
//!
//! Inbound HTTP surface for relay, served with Axum:
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /dispatch` | Dispatch a task, returns the full outcome |
//! | `POST /retrieve` | Ranked hybrid retrieval |
//! | `POST /documents` | Index or replace a document |
//! | `DELETE /documents/:doc_id` | Remove a document from both indices |
//! | `GET /agents` | Registry entries with breaker state |
//! | `GET /metrics` | Telemetry snapshot |
//! | `GET /health` | Liveness |

mod error;
mod server;
mod state;

pub use error::ApiError;
pub use server::{app, serve};
pub use state::{AppState, SharedState};
