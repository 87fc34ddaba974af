use arogya_shared::{ChatError, ErrorCode};
use arogya_store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Collapse into the error reported to a live connection.
    ///
    /// Unknown conversations look the same as ones the caller may not see,
    /// and infrastructure failures surface as `DeliveryFailed`.
    pub fn into_chat_error(self) -> ChatError {
        match self {
            ServerError::Chat(e) => e,
            ServerError::NotFound(what) => {
                ChatError::Forbidden(format!("{what} is not accessible"))
            }
            ServerError::Internal(msg) => ChatError::DeliveryFailed(msg),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(e) => ServerError::Chat(e),
            StoreError::NotFound => ServerError::NotFound("record".into()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::AuthRequired => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden | ErrorCode::NotAMember => StatusCode::FORBIDDEN,
        ErrorCode::EmptyContent
        | ErrorCode::InvalidParticipants
        | ErrorCode::InvalidGroup
        | ErrorCode::DuplicateMember
        | ErrorCode::NotGroupConversation => StatusCode::BAD_REQUEST,
        ErrorCode::DeliveryFailed => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ServerError::Chat(e) => (status_for(e.code()), e.code().as_str(), e.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": { "code": code, "message": message },
        });

        (status, axum::Json(body)).into_response()
    }
}
