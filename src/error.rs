use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::provider::ProviderError;
use crate::scheduler::SchedulerError;

/// Failures surfaced by the login, callback and logout routes.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("state parameter does not match a pending authorization")]
    StateMismatch,

    #[error("no token for this authorization")]
    TokenNotFound,

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("token provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("token provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("could not schedule token refresh: {0}")]
    Scheduling(#[source] SchedulerError),

    #[error("could not cancel token refresh: {0}")]
    JobCancellationFailed(#[source] SchedulerError),

    #[error("could not delete token: {0}")]
    TokenDeletionFailed(anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ProviderError> for AuthError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unavailable(msg) => AuthError::ProviderUnavailable(msg),
            ProviderError::Rejected(msg) => AuthError::ProviderRejected(msg),
            e @ ProviderError::Malformed(_) => AuthError::Internal(e.into()),
        }
    }
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::error!(error = ?self, %status, "request failed");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
