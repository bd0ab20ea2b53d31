use std::sync::{Arc, Mutex};

use chrono::{NaiveDateTime, Utc};
use rusqlite::Connection;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::queries;
use crate::models::{AttemptStatus, Booking, BookingStatus, PaymentAttempt, StatusChange};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("booking not found: {0}")]
    NotFound(String),

    /// The conditional write matched zero rows: the caller's read is stale.
    /// Resolved by re-reading the canonical state, never surfaced to users.
    #[error("stale transition")]
    Conflict,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub user_id: String,
    pub station_id: String,
    pub charger_id: String,
    pub slot_start: NaiveDateTime,
    pub slot_end: NaiveDateTime,
    pub amount: i64,
    pub currency: String,
}

/// Attempt write carried inside a booking transition. Both land in one
/// transaction so a crash can never leave a settled attempt next to an
/// unsettled booking or vice versa.
pub enum AttemptMutation {
    Insert(PaymentAttempt),
    Finish {
        external_ref: String,
        to: AttemptStatus,
        failure_reason: Option<String>,
    },
}

/// Durable owner of bookings and their payment attempts. Every successful
/// transition emits a [`StatusChange`] on the broadcast channel for the
/// notification dispatcher.
pub struct BookingStore {
    db: Arc<Mutex<Connection>>,
    events: broadcast::Sender<StatusChange>,
}

impl BookingStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { db, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    pub fn create_booking(&self, new: NewBooking) -> Result<Booking, StoreError> {
        let now = Utc::now().naive_utc();
        let booking = Booking {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            station_id: new.station_id,
            charger_id: new.charger_id,
            slot_start: new.slot_start,
            slot_end: new.slot_end,
            amount: new.amount,
            currency: new.currency,
            status: BookingStatus::Pending,
            active_attempt_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock().unwrap();
        queries::insert_booking(&db, &booking)?;
        Ok(booking)
    }

    pub fn booking(&self, id: &str) -> Result<Booking, StoreError> {
        let db = self.db.lock().unwrap();
        queries::get_booking(&db, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Conditional transition with optimistic concurrency. Fails with
    /// [`StoreError::Conflict`] when the booking left `allowed_from` or its
    /// version moved since the caller's read, or when the attached attempt
    /// mutation hits an already-terminal attempt.
    pub fn transition(
        &self,
        booking_id: &str,
        allowed_from: &[BookingStatus],
        to: BookingStatus,
        expected_version: i64,
        active_attempt_id: Option<&str>,
        attempt: Option<AttemptMutation>,
    ) -> Result<Booking, StoreError> {
        let now = Utc::now().naive_utc();

        let (booking, change) = {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;

            let current = queries::get_booking(&tx, booking_id)?
                .ok_or_else(|| StoreError::NotFound(booking_id.to_string()))?;
            if current.version != expected_version || !allowed_from.contains(&current.status) {
                return Err(StoreError::Conflict);
            }

            let attempt_id = match &attempt {
                Some(AttemptMutation::Insert(a)) => {
                    queries::insert_attempt(&tx, a)?;
                    Some(a.id.clone())
                }
                Some(AttemptMutation::Finish {
                    external_ref,
                    to,
                    failure_reason,
                }) => {
                    let changed = queries::finish_attempt(
                        &tx,
                        external_ref,
                        *to,
                        failure_reason.as_deref(),
                        &now,
                    )?;
                    if changed == 0 {
                        // the attempt already went terminal under someone else
                        return Err(StoreError::Conflict);
                    }
                    current.active_attempt_id.clone()
                }
                None => current.active_attempt_id.clone(),
            };

            let changed = queries::update_booking_status(
                &tx,
                booking_id,
                allowed_from,
                to,
                expected_version,
                active_attempt_id,
                &now,
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict);
            }

            let booking = queries::get_booking(&tx, booking_id)?
                .ok_or_else(|| StoreError::NotFound(booking_id.to_string()))?;
            tx.commit()?;

            let change = StatusChange {
                booking_id: booking_id.to_string(),
                from: current.status,
                to,
                attempt_id,
                at: now,
            };
            (booking, change)
        };

        let _ = self.events.send(change);
        Ok(booking)
    }

    pub fn attempt_by_ref(&self, external_ref: &str) -> Result<Option<PaymentAttempt>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(queries::attempt_by_ref(&db, external_ref)?)
    }

    pub fn attempt_by_id(&self, id: &str) -> Result<Option<PaymentAttempt>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(queries::attempt_by_id(&db, id)?)
    }

    pub fn attempts_for_booking(
        &self,
        booking_id: &str,
    ) -> Result<Vec<PaymentAttempt>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(queries::attempts_for_booking(&db, booking_id)?)
    }

    pub fn attempt_count(&self, booking_id: &str) -> Result<i64, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(queries::attempt_count(&db, booking_id)?)
    }

    pub fn record_lookup(&self, external_ref: &str) -> Result<(), StoreError> {
        let now = Utc::now().naive_utc();
        let db = self.db.lock().unwrap();
        queries::record_lookup(&db, external_ref, &now)?;
        Ok(())
    }

    /// Returns false when the reference is unknown to the store.
    pub fn record_webhook_payload(
        &self,
        external_ref: &str,
        raw_payload: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().naive_utc();
        let db = self.db.lock().unwrap();
        let changed = queries::record_webhook_payload(&db, external_ref, raw_payload, &now)?;
        Ok(changed > 0)
    }

    pub fn stale_attempts(
        &self,
        cutoff: &NaiveDateTime,
    ) -> Result<Vec<PaymentAttempt>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(queries::stale_attempts(&db, cutoff)?)
    }

    pub fn bookings_to_start(&self, now: &NaiveDateTime) -> Result<Vec<Booking>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(queries::bookings_to_start(&db, now)?)
    }

    pub fn bookings_to_complete(&self, now: &NaiveDateTime) -> Result<Vec<Booking>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(queries::bookings_to_complete(&db, now)?)
    }
}
