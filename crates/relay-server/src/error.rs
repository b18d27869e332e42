//! HTTP mapping of relay errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use relay_core::RelayError;
use tracing::error;

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RelayError::AgentNotFound(_) | RelayError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::DuplicateAgent(_) => StatusCode::CONFLICT,
            RelayError::Retrieval(_) | RelayError::Serialization(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<RelayError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
