//! API error types and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors surfaced to API clients before streaming begins.
///
/// Rendered as `{"detail": <message>}` JSON. Failures after the response has
/// started streaming never reach this type; they surface as in-band text.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The user message was empty or whitespace-only.
    #[error("Message cannot be empty")]
    EmptyMessage,

    /// Any other failure prior to streaming.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::EmptyMessage => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(name: "api.request.failed", error = %self, "Request failed");
        }

        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_message_maps_to_400_detail() {
        let response = ApiError::EmptyMessage.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["detail"], "Message cannot be empty");
    }

    #[tokio::test]
    async fn test_internal_maps_to_500() {
        let err = ApiError::from(anyhow::anyhow!("listener gone"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["detail"], "listener gone");
    }
}
