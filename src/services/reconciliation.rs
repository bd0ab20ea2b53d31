use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{AttemptMutation, BookingStore, StoreError};
use crate::errors::AppError;
use crate::models::{AttemptStatus, Booking, BookingStatus, Gateway, PaymentAttempt};
use crate::services::gateways::{
    GatewayError, GatewayLookup, GatewayPaymentStatus, PaymentGateway,
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Canonical result of a reconciliation pass: the booking and the attempt as
/// the store now records them.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub booking: Booking,
    pub attempt: PaymentAttempt,
}

impl VerifyOutcome {
    /// The four statuses a user may see. Raw gateway vocabulary never leaks.
    pub fn user_facing(&self) -> &'static str {
        match self.attempt.status {
            AttemptStatus::Completed => "succeeded",
            AttemptStatus::Initiated | AttemptStatus::Pending => "pending",
            AttemptStatus::UserCanceled => "canceled",
            AttemptStatus::Failed | AttemptStatus::Expired => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitiateOutcome {
    pub booking: Booking,
    pub attempt: PaymentAttempt,
    pub redirect_url: String,
    pub form_payload: Option<serde_json::Value>,
}

/// Converges return redirects, webhooks and scheduled re-checks onto one
/// persisted booking state. Redirect and webhook payloads are triggers only;
/// every settlement goes through the gateway lookup API.
pub struct ReconciliationEngine {
    store: Arc<BookingStore>,
    gateways: HashMap<Gateway, Arc<dyn PaymentGateway>>,
    /// Per-external_ref locks: concurrent verifies for one reference
    /// serialize here, and whoever enters second finds the attempt already
    /// terminal and does no network call.
    inflight: DashMap<String, Arc<Mutex<()>>>,
    retry: RetryPolicy,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<BookingStore>) -> Self {
        Self {
            store,
            gateways: HashMap::new(),
            inflight: DashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.name(), gateway);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn gateway(&self, name: Gateway) -> Result<&Arc<dyn PaymentGateway>, AppError> {
        self.gateways
            .get(&name)
            .ok_or_else(|| AppError::UnknownGateway(name.as_str().to_string()))
    }

    fn lock_for(&self, external_ref: &str) -> Arc<Mutex<()>> {
        self.inflight
            .entry(external_ref.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Starts a payment for a booking. At most one attempt may be live per
    /// booking; a second initiate while one is in flight is rejected rather
    /// than superseding it.
    pub async fn initiate(
        &self,
        booking_id: &str,
        gateway_name: Gateway,
    ) -> Result<InitiateOutcome, AppError> {
        let booking = self.store.booking(booking_id)?;

        match booking.status {
            BookingStatus::Pending | BookingStatus::PaymentFailed => {}
            BookingStatus::AwaitingPayment => {
                if let Some(active_id) = &booking.active_attempt_id {
                    if let Some(active) = self.store.attempt_by_id(active_id)? {
                        if !active.status.is_terminal() {
                            return Err(AppError::ActiveAttempt(booking.id.clone()));
                        }
                    }
                }
            }
            _ => {
                return Err(AppError::BadRequest(format!(
                    "booking is not payable in status {}",
                    booking.status.as_str()
                )))
            }
        }

        let attempt_number = self.store.attempt_count(booking_id)? + 1;
        let order_ref = format!("BK-{}-{}", booking.id, attempt_number);

        let gateway = self.gateway(gateway_name)?;
        let initiated = self
            .initiate_with_retry(gateway.as_ref(), &booking, &order_ref)
            .await?;

        let now = Utc::now().naive_utc();
        let attempt = PaymentAttempt {
            id: Uuid::new_v4().to_string(),
            booking_id: booking.id.clone(),
            gateway: gateway_name,
            external_ref: initiated.external_ref.clone(),
            status: AttemptStatus::Initiated,
            attempt_number,
            amount: booking.amount,
            currency: booking.currency.clone(),
            failure_reason: None,
            raw_callback_payload: None,
            last_lookup_at: None,
            created_at: now,
            updated_at: now,
        };

        let attempt_id = attempt.id.clone();
        let booking = self
            .store
            .transition(
                &booking.id,
                &[
                    BookingStatus::Pending,
                    BookingStatus::AwaitingPayment,
                    BookingStatus::PaymentFailed,
                ],
                BookingStatus::AwaitingPayment,
                booking.version,
                Some(&attempt_id),
                Some(AttemptMutation::Insert(attempt.clone())),
            )
            .map_err(|e| match e {
                // someone else initiated between our read and our write
                StoreError::Conflict => AppError::ActiveAttempt(booking_id.to_string()),
                other => AppError::Store(other),
            })?;

        tracing::info!(
            booking_id = %booking.id,
            external_ref = %attempt.external_ref,
            gateway = gateway_name.as_str(),
            attempt_number,
            "payment attempt initiated"
        );

        Ok(InitiateOutcome {
            booking,
            attempt,
            redirect_url: initiated.redirect_url,
            form_payload: initiated.form_payload,
        })
    }

    /// Reconciles one payment reference against the gateway's source of
    /// truth. Idempotent: a terminal attempt is returned as stored, with no
    /// further gateway traffic.
    pub async fn verify(&self, external_ref: &str) -> Result<VerifyOutcome, AppError> {
        // fast path, no lock and no network
        let attempt = self.require_attempt(external_ref)?;
        if attempt.status.is_terminal() {
            return self.stored_outcome(attempt);
        }

        let lock = self.lock_for(external_ref);
        let _guard = lock.lock().await;

        // a concurrent verify may have settled this while we waited
        let attempt = self.require_attempt(external_ref)?;
        if attempt.status.is_terminal() {
            return self.stored_outcome(attempt);
        }

        let gateway = self.gateway(attempt.gateway)?.clone();
        let outcome = match self.lookup_with_retry(gateway.as_ref(), &attempt).await {
            Ok(lookup) => self.apply_lookup(&attempt, lookup)?,
            Err(e) => {
                tracing::warn!(
                    external_ref = %external_ref,
                    error = %e,
                    "lookup retries exhausted, expiring attempt"
                );
                self.settle(&attempt, AttemptStatus::Expired, Some("gateway lookup failed".into()))?
            }
        };

        if outcome.attempt.status.is_terminal() {
            self.inflight.remove(external_ref);
        }
        Ok(outcome)
    }

    /// Redirect returns report a claimed status, which is logged and then
    /// ignored: the caller gets whatever the lookup-backed verify concludes.
    pub async fn handle_return(
        &self,
        external_ref: &str,
        claimed_status: Option<&str>,
    ) -> Result<VerifyOutcome, AppError> {
        tracing::info!(
            external_ref = %external_ref,
            claimed = claimed_status.unwrap_or("-"),
            "payment return received"
        );
        self.verify(external_ref).await
    }

    /// A webhook with a valid signature authorizes a verify; its payload is
    /// stored for audit and otherwise ignored. An invalid signature mutates
    /// nothing and triggers no lookup.
    pub async fn handle_webhook(
        &self,
        gateway_name: Gateway,
        raw_payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<VerifyOutcome, AppError> {
        let gateway = self.gateway(gateway_name)?;

        if !gateway.verify_signature(raw_payload, headers) {
            tracing::warn!(gateway = gateway_name.as_str(), "webhook signature rejected");
            return Err(AppError::InvalidSignature);
        }

        let external_ref = gateway
            .external_ref_from_webhook(raw_payload)
            .ok_or_else(|| {
                AppError::BadRequest("webhook payload carries no payment reference".into())
            })?;

        let known = self
            .store
            .record_webhook_payload(&external_ref, &String::from_utf8_lossy(raw_payload))?;
        if !known {
            return Err(AppError::UnknownReference(external_ref));
        }

        tracing::info!(
            gateway = gateway_name.as_str(),
            external_ref = %external_ref,
            "webhook accepted"
        );
        self.verify(&external_ref).await
    }

    /// Ages out an attempt that never settled. Used by the sweeper once the
    /// payment window has elapsed.
    pub async fn expire(&self, external_ref: &str) -> Result<VerifyOutcome, AppError> {
        let lock = self.lock_for(external_ref);
        let _guard = lock.lock().await;

        let attempt = self.require_attempt(external_ref)?;
        if attempt.status.is_terminal() {
            return self.stored_outcome(attempt);
        }

        let outcome = self.settle(
            &attempt,
            AttemptStatus::Expired,
            Some("payment window elapsed".into()),
        )?;
        self.inflight.remove(external_ref);
        Ok(outcome)
    }

    // ── internals ──

    fn require_attempt(&self, external_ref: &str) -> Result<PaymentAttempt, AppError> {
        self.store
            .attempt_by_ref(external_ref)?
            .ok_or_else(|| AppError::UnknownReference(external_ref.to_string()))
    }

    fn stored_outcome(&self, attempt: PaymentAttempt) -> Result<VerifyOutcome, AppError> {
        let booking = self.store.booking(&attempt.booking_id)?;
        Ok(VerifyOutcome { booking, attempt })
    }

    /// The transition table. All business logic between the lookup and the
    /// conditional write is synchronous and pure.
    fn apply_lookup(
        &self,
        attempt: &PaymentAttempt,
        lookup: GatewayLookup,
    ) -> Result<VerifyOutcome, AppError> {
        match lookup.status {
            GatewayPaymentStatus::Pending => {
                self.store.record_lookup(&attempt.external_ref)?;
                let attempt = self.require_attempt(&attempt.external_ref)?;
                self.stored_outcome(attempt)
            }
            GatewayPaymentStatus::Completed => {
                if lookup.amount != attempt.amount {
                    tracing::warn!(
                        external_ref = %attempt.external_ref,
                        expected = attempt.amount,
                        reported = lookup.amount,
                        "completed lookup reports a different amount"
                    );
                    return self.settle(
                        attempt,
                        AttemptStatus::Failed,
                        Some(format!(
                            "amount mismatch: gateway reported {}, attempt holds {}",
                            lookup.amount, attempt.amount
                        )),
                    );
                }
                self.settle(attempt, AttemptStatus::Completed, None)
            }
            GatewayPaymentStatus::UserCanceled => {
                self.settle(attempt, AttemptStatus::UserCanceled, None)
            }
            GatewayPaymentStatus::Failed => {
                self.settle(attempt, AttemptStatus::Failed, None)
            }
            GatewayPaymentStatus::Expired => {
                self.settle(attempt, AttemptStatus::Expired, Some("expired at gateway".into()))
            }
        }
    }

    /// Terminal write for attempt and booking in one transaction. A Conflict
    /// means a racing settle already produced the canonical state, which is
    /// re-read and returned as success.
    fn settle(
        &self,
        attempt: &PaymentAttempt,
        to: AttemptStatus,
        failure_reason: Option<String>,
    ) -> Result<VerifyOutcome, AppError> {
        let target = match to {
            AttemptStatus::Completed => BookingStatus::Confirmed,
            AttemptStatus::UserCanceled => BookingStatus::Cancelled,
            AttemptStatus::Failed | AttemptStatus::Expired => BookingStatus::PaymentFailed,
            AttemptStatus::Initiated | AttemptStatus::Pending => {
                unreachable!("settle only takes terminal statuses")
            }
        };

        let booking = self.store.booking(&attempt.booking_id)?;
        let result = self.store.transition(
            &booking.id,
            &[BookingStatus::AwaitingPayment],
            target,
            booking.version,
            None,
            Some(AttemptMutation::Finish {
                external_ref: attempt.external_ref.clone(),
                to,
                failure_reason,
            }),
        );

        match result {
            Ok(booking) => {
                tracing::info!(
                    booking_id = %booking.id,
                    external_ref = %attempt.external_ref,
                    status = booking.status.as_str(),
                    "payment attempt settled"
                );
                let attempt = self.require_attempt(&attempt.external_ref)?;
                Ok(VerifyOutcome { booking, attempt })
            }
            Err(StoreError::Conflict) => {
                let attempt = self.require_attempt(&attempt.external_ref)?;
                self.stored_outcome(attempt)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup_with_retry(
        &self,
        gateway: &dyn PaymentGateway,
        attempt: &PaymentAttempt,
    ) -> Result<GatewayLookup, GatewayError> {
        let mut delay = self.retry.initial_delay;
        let mut tries = 0;
        loop {
            tries += 1;
            match gateway.lookup(attempt).await {
                Ok(lookup) => return Ok(lookup),
                Err(e) if e.is_transient() && tries < self.retry.max_attempts => {
                    tracing::warn!(
                        external_ref = %attempt.external_ref,
                        tries,
                        error = %e,
                        "gateway lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.retry.max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn initiate_with_retry(
        &self,
        gateway: &dyn PaymentGateway,
        booking: &Booking,
        order_ref: &str,
    ) -> Result<crate::services::gateways::InitiatedPayment, AppError> {
        let mut delay = self.retry.initial_delay;
        let mut tries = 0;
        loop {
            tries += 1;
            match gateway.initiate(booking, order_ref).await {
                Ok(initiated) => return Ok(initiated),
                Err(e) if e.is_transient() && tries < self.retry.max_attempts => {
                    tracing::warn!(
                        booking_id = %booking.id,
                        tries,
                        error = %e,
                        "gateway initiate failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.retry.max_delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
