use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use crate::errors::AppError;
use crate::models::Gateway;
use crate::state::AppState;

#[derive(Serialize)]
pub struct WebhookResponse {
    booking_id: String,
    status: &'static str,
}

/// POST /webhooks/:gateway — signature is checked before anything else is
/// touched; a bad one gets a 403 and the store stays as it was.
pub async fn gateway_webhook(
    State(state): State<Arc<AppState>>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let gateway =
        Gateway::parse(&gateway).ok_or_else(|| AppError::UnknownGateway(gateway.clone()))?;

    let outcome = state
        .engine
        .handle_webhook(gateway, &body, &headers)
        .await?;

    Ok(Json(WebhookResponse {
        status: outcome.user_facing(),
        booking_id: outcome.booking.id,
    }))
}
