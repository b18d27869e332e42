//! Wire types for the uniform agent contract

use relay_core::{Budgets, ContextDocument, FailureKind, Mode, RiskTier, TaskRequest};
use serde::{Deserialize, Serialize};

/// Body of `POST {endpoint}/execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub request_id: String,
    pub task_type: String,
    pub risk_tier: RiskTier,
    pub mode: Mode,
    pub payload: serde_json::Value,
    /// Documents retrieved for this task, if the task type asks for them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_context: Option<Vec<ContextDocument>>,
    pub budgets: Budgets,
}

impl ExecuteRequest {
    pub fn from_task(
        task: &TaskRequest,
        retrieval_context: Option<Vec<ContextDocument>>,
        budgets: Budgets,
    ) -> Self {
        Self {
            request_id: task.request_id.clone(),
            task_type: task.task_type.clone(),
            risk_tier: task.risk_tier,
            mode: task.mode,
            payload: task.payload.clone(),
            retrieval_context,
            budgets,
        }
    }
}

/// Successful agent reply
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ExecuteReply {
    pub result: serde_json::Value,
}

/// Typed error reply: `{"error": {"kind": "transient", "message": "..."}}`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorReply {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorDetail {
    pub kind: FailureKind,
    pub message: String,
}
