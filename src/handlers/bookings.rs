use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::queries::fmt_dt;
use crate::db::NewBooking;
use crate::errors::AppError;
use crate::models::Booking;
use crate::state::AppState;

// POST /bookings

#[derive(Deserialize)]
pub struct CreateBookingRequest {
    pub user_id: String,
    pub station_id: String,
    pub charger_id: String,
    pub slot_start: NaiveDateTime,
    pub slot_end: NaiveDateTime,
    pub amount: i64,
    pub currency: Option<String>,
}

#[derive(Serialize)]
pub struct BookingResponse {
    id: String,
    user_id: String,
    station_id: String,
    charger_id: String,
    slot_start: String,
    slot_end: String,
    amount: i64,
    currency: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl From<Booking> for BookingResponse {
    fn from(b: Booking) -> Self {
        BookingResponse {
            id: b.id,
            user_id: b.user_id,
            station_id: b.station_id,
            charger_id: b.charger_id,
            slot_start: fmt_dt(&b.slot_start),
            slot_end: fmt_dt(&b.slot_end),
            amount: b.amount,
            currency: b.currency,
            status: b.status.as_str().to_string(),
            created_at: fmt_dt(&b.created_at),
            updated_at: fmt_dt(&b.updated_at),
        }
    }
}

pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), AppError> {
    if req.amount <= 0 {
        return Err(AppError::BadRequest("amount must be positive".into()));
    }
    if req.slot_end <= req.slot_start {
        return Err(AppError::BadRequest("slot_end must be after slot_start".into()));
    }

    let booking = state.store.create_booking(NewBooking {
        user_id: req.user_id,
        station_id: req.station_id,
        charger_id: req.charger_id,
        slot_start: req.slot_start,
        slot_end: req.slot_end,
        amount: req.amount,
        currency: req.currency.unwrap_or_else(|| "NPR".to_string()),
    })?;

    tracing::info!(booking_id = %booking.id, "booking created");
    Ok((StatusCode::CREATED, Json(booking.into())))
}

// GET /bookings/:id — safe to poll; never exposes raw gateway payloads

pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BookingResponse>, AppError> {
    let booking = state.store.booking(&id)?;
    Ok(Json(booking.into()))
}

// GET /bookings/:id/payments — audit trail of attempts, newest first

#[derive(Serialize)]
pub struct AttemptResponse {
    id: String,
    gateway: String,
    external_ref: String,
    status: String,
    attempt_number: i64,
    amount: i64,
    currency: String,
    failure_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AttemptResponse>>, AppError> {
    // 404 for unknown bookings rather than an empty list
    state.store.booking(&id)?;

    let attempts = state.store.attempts_for_booking(&id)?;
    let response = attempts
        .into_iter()
        .map(|a| AttemptResponse {
            id: a.id,
            gateway: a.gateway.as_str().to_string(),
            external_ref: a.external_ref,
            status: a.status.as_str().to_string(),
            attempt_number: a.attempt_number,
            amount: a.amount,
            currency: a.currency,
            failure_reason: a.failure_reason,
            created_at: fmt_dt(&a.created_at),
            updated_at: fmt_dt(&a.updated_at),
        })
        .collect();

    Ok(Json(response))
}
