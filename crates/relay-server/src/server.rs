//! Axum routes for dispatch, retrieval and introspection

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use relay_agent::BreakerSnapshot;
use relay_core::{
    AgentDescriptor, DispatchFailureReason, DispatchOutcome, Document, RelayError,
    RetrievalQuery, RetrievalResult, TaskRequest,
};
use relay_metrics::MetricsSnapshot;
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::error::ApiError;
use crate::state::SharedState;

/// Build the router over shared state
pub fn app(state: SharedState) -> Router {
    Router::new()
        .route("/dispatch", post(dispatch))
        .route("/retrieve", post(retrieve))
        .route("/documents", post(index_document))
        .route("/documents/:doc_id", delete(delete_document))
        .route("/agents", get(agents))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the listener fails
pub async fn serve(state: SharedState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("relay listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// HTTP status for a dispatch outcome; the body is always the outcome itself
fn outcome_status(outcome: &DispatchOutcome) -> StatusCode {
    match outcome {
        DispatchOutcome::Success { .. } => StatusCode::OK,
        DispatchOutcome::Failure { reason, .. } => match reason {
            DispatchFailureReason::UnknownTaskType
            | DispatchFailureReason::RiskTierViolation
            | DispatchFailureReason::Rejected => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchFailureReason::NoEligibleAgent | DispatchFailureReason::Exhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        },
    }
}

/// POST /dispatch
async fn dispatch(State(app): State<SharedState>, Json(request): Json<TaskRequest>) -> Response {
    let outcome = app.dispatcher.dispatch(request).await;
    (outcome_status(&outcome), Json(outcome)).into_response()
}

/// POST /retrieve
async fn retrieve(
    State(app): State<SharedState>,
    Json(query): Json<RetrievalQuery>,
) -> Result<Json<Vec<RetrievalResult>>, ApiError> {
    Ok(Json(app.retriever.search(&query)?))
}

#[derive(Debug, Serialize)]
struct Indexed {
    doc_id: String,
    replaced: bool,
}

/// POST /documents
async fn index_document(
    State(app): State<SharedState>,
    Json(document): Json<Document>,
) -> Result<(StatusCode, Json<Indexed>), ApiError> {
    let doc_id = document.doc_id.clone();
    let replaced = app.retriever.index(document)?.is_some();
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(Indexed { doc_id, replaced })))
}

/// DELETE /documents/:doc_id
async fn delete_document(
    State(app): State<SharedState>,
    Path(doc_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match app.retriever.delete(&doc_id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(RelayError::DocumentNotFound(doc_id).into()),
    }
}

#[derive(Debug, Serialize)]
struct AgentView {
    #[serde(flatten)]
    agent: AgentDescriptor,
    breaker: Option<BreakerSnapshot>,
}

/// GET /agents
async fn agents(State(app): State<SharedState>) -> Json<Vec<AgentView>> {
    let mut breakers = app.dispatcher.breakers().snapshot();
    let views = app
        .dispatcher
        .registry()
        .all()
        .into_iter()
        .map(|agent| AgentView {
            breaker: breakers.remove(&agent.id),
            agent,
        })
        .collect();
    Json(views)
}

/// GET /metrics
async fn metrics(State(app): State<SharedState>) -> Json<MetricsSnapshot> {
    Json(app.dispatcher.metrics().snapshot().await)
}

/// GET /health
async fn health(State(app): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "relay",
        "agents": app.dispatcher.registry().len(),
        "documents": app.retriever.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_status() {
        let failure = |reason| DispatchOutcome::Failure {
            request_id: "r".to_string(),
            reason,
            message: String::new(),
            attempts: Vec::new(),
        };
        assert_eq!(
            outcome_status(&failure(DispatchFailureReason::RiskTierViolation)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            outcome_status(&failure(DispatchFailureReason::Exhausted)),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
