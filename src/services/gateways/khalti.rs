use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use super::{GatewayError, GatewayLookup, GatewayPaymentStatus, InitiatedPayment, PaymentGateway};
use crate::models::{Booking, Gateway, PaymentAttempt};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Khalti-style gateway: initiate returns a hosted payment URL plus a pidx
/// reference; the lookup endpoint is the source of truth for that pidx.
pub struct KhaltiGateway {
    base_url: String,
    secret_key: String,
    webhook_secret: String,
    return_url: String,
    website_url: String,
    client: reqwest::Client,
}

impl KhaltiGateway {
    pub fn new(
        base_url: String,
        secret_key: String,
        webhook_secret: String,
        return_url: String,
        website_url: String,
    ) -> Self {
        Self {
            base_url,
            secret_key,
            webhook_secret,
            return_url,
            website_url,
            client: reqwest::Client::new(),
        }
    }

    fn fold_status(status: &str) -> GatewayPaymentStatus {
        match status {
            "Completed" => GatewayPaymentStatus::Completed,
            "Pending" | "Initiated" => GatewayPaymentStatus::Pending,
            "User canceled" => GatewayPaymentStatus::UserCanceled,
            "Expired" => GatewayPaymentStatus::Expired,
            // Refunded money is not payable-again and must never confirm
            _ => GatewayPaymentStatus::Failed,
        }
    }
}

#[async_trait]
impl PaymentGateway for KhaltiGateway {
    fn name(&self) -> Gateway {
        Gateway::Khalti
    }

    async fn initiate(
        &self,
        booking: &Booking,
        external_ref_hint: &str,
    ) -> Result<InitiatedPayment, GatewayError> {
        let body = json!({
            "return_url": format!("{}?bookingId={}", self.return_url, booking.id),
            "website_url": self.website_url,
            // rupees to paisa
            "amount": booking.amount * 100,
            "purchase_order_id": external_ref_hint,
            "purchase_order_name": "EV Charge Booking",
        });

        let resp = self
            .client
            .post(format!("{}/epayment/initiate/", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .header("Authorization", format!("Key {}", self.secret_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let data: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body: data.to_string(),
            });
        }

        let pidx = data["pidx"]
            .as_str()
            .ok_or_else(|| GatewayError::Decode("missing pidx in initiate response".into()))?;
        let payment_url = data["payment_url"].as_str().ok_or_else(|| {
            GatewayError::Decode("missing payment_url in initiate response".into())
        })?;

        Ok(InitiatedPayment {
            external_ref: pidx.to_string(),
            redirect_url: payment_url.to_string(),
            form_payload: None,
        })
    }

    async fn lookup(&self, attempt: &PaymentAttempt) -> Result<GatewayLookup, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/epayment/lookup/", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .header("Authorization", format!("Key {}", self.secret_key))
            .json(&json!({ "pidx": attempt.external_ref }))
            .send()
            .await?;

        let status = resp.status();
        let data: serde_json::Value = resp.json().await?;

        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body: data.to_string(),
            });
        }

        let state = data["status"]
            .as_str()
            .ok_or_else(|| GatewayError::Decode("missing status in lookup response".into()))?;
        let total_amount = data["total_amount"]
            .as_i64()
            .ok_or_else(|| GatewayError::Decode("missing total_amount in lookup response".into()))?;

        Ok(GatewayLookup {
            status: Self::fold_status(state),
            // paisa back to rupees
            amount: total_amount / 100,
            verified_at: Utc::now().naive_utc(),
        })
    }

    fn verify_signature(&self, raw_payload: &[u8], headers: &HeaderMap) -> bool {
        if self.webhook_secret.is_empty() {
            tracing::warn!("khalti webhook secret not configured, rejecting webhook");
            return false;
        }

        let signature = headers
            .get("x-khalti-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if signature.is_empty() {
            return false;
        }

        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(signature) else {
            return false;
        };

        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.webhook_secret.as_bytes()) else {
            return false;
        };
        mac.update(raw_payload);
        mac.verify_slice(&decoded).is_ok()
    }

    fn external_ref_from_webhook(&self, raw_payload: &[u8]) -> Option<String> {
        let data: serde_json::Value = serde_json::from_slice(raw_payload).ok()?;
        data["pidx"].as_str().map(|s| s.to_string())
    }
}
