use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::db::StoreError;
use crate::services::gateways::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("unknown payment reference: {0}")]
    UnknownReference(String),

    #[error("a payment attempt is already in flight for booking {0}")]
    ActiveAttempt(String),

    #[error("unknown gateway: {0}")]
    UnknownGateway(String),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Store(StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            // a lost optimistic race resolves to the canonical state inside
            // the engine; one reaching here is a bug worth a loud log
            AppError::Store(StoreError::Conflict) => {
                tracing::error!("unresolved transition conflict escaped the engine");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            AppError::Store(StoreError::Database(e)) => {
                tracing::error!(error = %e, "database failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            // raw gateway text stays in the logs, never in the response
            AppError::Gateway(e) => {
                tracing::error!(error = %e, "gateway failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "payment gateway unavailable".to_string(),
                )
            }
            AppError::InvalidSignature => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::UnknownReference(r) => {
                tracing::warn!(external_ref = %r, "payment reference not found in store");
                (StatusCode::NOT_FOUND, self.to_string())
            }
            AppError::ActiveAttempt(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::UnknownGateway(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}
