use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: String,
    pub booking_id: String,
    pub gateway: Gateway,
    /// Gateway-issued reference (Khalti pidx, eSewa transaction uuid).
    /// Correlates redirect, webhook and lookup for one attempt.
    pub external_ref: String,
    pub status: AttemptStatus,
    pub attempt_number: i64,
    pub amount: i64,
    pub currency: String,
    pub failure_reason: Option<String>,
    /// Opaque audit copy of the last webhook body. Never read for decisions.
    pub raw_callback_payload: Option<String>,
    pub last_lookup_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Initiated,
    Pending,
    Completed,
    UserCanceled,
    Failed,
    Expired,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Initiated => "initiated",
            AttemptStatus::Pending => "pending",
            AttemptStatus::Completed => "completed",
            AttemptStatus::UserCanceled => "user_canceled",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => AttemptStatus::Pending,
            "completed" => AttemptStatus::Completed,
            "user_canceled" => AttemptStatus::UserCanceled,
            "failed" => AttemptStatus::Failed,
            "expired" => AttemptStatus::Expired,
            _ => AttemptStatus::Initiated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Initiated | AttemptStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Gateway {
    Khalti,
    Esewa,
}

impl Gateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gateway::Khalti => "khalti",
            Gateway::Esewa => "esewa",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "khalti" => Some(Gateway::Khalti),
            "esewa" => Some(Gateway::Esewa),
            _ => None,
        }
    }
}
