use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub user_id: String,
    pub station_id: String,
    pub charger_id: String,
    pub slot_start: NaiveDateTime,
    pub slot_end: NaiveDateTime,
    /// Whole rupees. Gateways that bill in paisa convert at the edge.
    pub amount: i64,
    pub currency: String,
    pub status: BookingStatus,
    pub active_attempt_id: Option<String>,
    /// Bumped on every successful transition; conditional updates compare it.
    pub version: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    AwaitingPayment,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    PaymentFailed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::AwaitingPayment => "awaiting_payment",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::PaymentFailed => "payment_failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "awaiting_payment" => BookingStatus::AwaitingPayment,
            "confirmed" => BookingStatus::Confirmed,
            "in_progress" => BookingStatus::InProgress,
            "completed" => BookingStatus::Completed,
            "cancelled" => BookingStatus::Cancelled,
            "payment_failed" => BookingStatus::PaymentFailed,
            _ => BookingStatus::Pending,
        }
    }
}

/// Emitted by the store on every successful transition; consumed by the
/// notification dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub booking_id: String,
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub attempt_id: Option<String>,
    pub at: NaiveDateTime,
}
