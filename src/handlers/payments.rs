use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::Gateway;
use crate::state::AppState;

// POST /payments/:gateway/initiate

#[derive(Deserialize)]
pub struct InitiateRequest {
    pub booking_id: String,
}

#[derive(Serialize)]
pub struct InitiateResponse {
    booking_id: String,
    external_ref: String,
    attempt_number: i64,
    redirect_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    form_payload: Option<serde_json::Value>,
}

pub async fn initiate(
    State(state): State<Arc<AppState>>,
    Path(gateway): Path<String>,
    Json(req): Json<InitiateRequest>,
) -> Result<Json<InitiateResponse>, AppError> {
    let gateway =
        Gateway::parse(&gateway).ok_or_else(|| AppError::UnknownGateway(gateway.clone()))?;

    let outcome = state.engine.initiate(&req.booking_id, gateway).await?;

    Ok(Json(InitiateResponse {
        booking_id: outcome.booking.id,
        external_ref: outcome.attempt.external_ref,
        attempt_number: outcome.attempt.attempt_number,
        redirect_url: outcome.redirect_url,
        form_payload: outcome.form_payload,
    }))
}

// GET /payments/return — browser redirect back from the gateway. The query
// string is an untrusted claim; it selects which reference to verify and
// nothing else.

#[derive(Deserialize)]
pub struct ReturnQuery {
    /// Khalti-style reference.
    pub pidx: Option<String>,
    /// eSewa-style reference.
    pub transaction_uuid: Option<String>,
    pub status: Option<String>,
    #[allow(dead_code)]
    pub purchase_order_id: Option<String>,
}

#[derive(Serialize)]
pub struct PaymentStatusResponse {
    booking_id: String,
    /// One of: succeeded, pending, canceled, failed.
    status: &'static str,
    booking_status: String,
}

pub async fn payment_return(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReturnQuery>,
) -> Result<Json<PaymentStatusResponse>, AppError> {
    let external_ref = query
        .pidx
        .as_deref()
        .or(query.transaction_uuid.as_deref())
        .ok_or_else(|| AppError::BadRequest("missing payment reference".into()))?;

    let outcome = state
        .engine
        .handle_return(external_ref, query.status.as_deref())
        .await?;

    Ok(Json(PaymentStatusResponse {
        status: outcome.user_facing(),
        booking_status: outcome.booking.status.as_str().to_string(),
        booking_id: outcome.booking.id,
    }))
}
