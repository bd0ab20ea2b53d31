pub mod esewa;
pub mod khalti;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::NaiveDateTime;

use crate::models::{Booking, Gateway, PaymentAttempt};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Worth another try with backoff: network trouble and 5xx answers.
    /// Auth failures and malformed responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Api { status, .. } => *status >= 500,
            GatewayError::Decode(_) => false,
        }
    }
}

/// Gateway status folded out of each vendor's vocabulary. The engine only
/// ever sees these five.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPaymentStatus {
    Completed,
    Pending,
    UserCanceled,
    Failed,
    Expired,
}

#[derive(Debug, Clone)]
pub struct InitiatedPayment {
    pub external_ref: String,
    pub redirect_url: String,
    /// Signed form fields for gateways that take a browser POST instead of a
    /// plain redirect (eSewa-style). Passed through to the UI untouched.
    pub form_payload: Option<serde_json::Value>,
}

/// Result of the authoritative lookup call. The only input from which a
/// payment attempt may be settled.
#[derive(Debug, Clone)]
pub struct GatewayLookup {
    pub status: GatewayPaymentStatus,
    /// Whole rupees, as the gateway reports them.
    pub amount: i64,
    pub verified_at: NaiveDateTime,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> Gateway;

    /// Registers a payment with the gateway and returns where to send the
    /// user. `external_ref_hint` is our order reference; gateways that issue
    /// their own reference (Khalti's pidx) return that instead.
    async fn initiate(
        &self,
        booking: &Booking,
        external_ref_hint: &str,
    ) -> Result<InitiatedPayment, GatewayError>;

    /// Authoritative status query. Idempotent and safe to retry.
    async fn lookup(&self, attempt: &PaymentAttempt) -> Result<GatewayLookup, GatewayError>;

    /// Whether a webhook body is worth acting on. A passing check authorizes
    /// a lookup, nothing more; the claimed status inside is still ignored.
    fn verify_signature(&self, raw_payload: &[u8], headers: &HeaderMap) -> bool;

    fn external_ref_from_webhook(&self, raw_payload: &[u8]) -> Option<String>;
}
