use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::db::{BookingStore, StoreError};
use crate::models::BookingStatus;
use crate::services::reconciliation::ReconciliationEngine;

/// Safety net for lost webhooks and abandoned redirects, plus the booking
/// slot lifecycle the payment flow hands over to.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often the sweep runs.
    pub interval_secs: u64,
    /// Attempts untouched for this long get re-verified.
    pub recheck_after_secs: i64,
    /// Attempts still unsettled this long after creation are expired.
    pub expire_after_secs: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            recheck_after_secs: 600,
            expire_after_secs: 3600,
        }
    }
}

pub fn spawn(
    engine: Arc<ReconciliationEngine>,
    store: Arc<BookingStore>,
    config: SweeperConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            interval_secs = config.interval_secs,
            recheck_after_secs = config.recheck_after_secs,
            expire_after_secs = config.expire_after_secs,
            "sweeper started"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
        loop {
            interval.tick().await;

            if let Err(e) = sweep_payments(&engine, &store, &config).await {
                tracing::warn!(error = %e, "payment sweep failed");
            }
            if let Err(e) = sweep_bookings(&store) {
                tracing::warn!(error = %e, "booking sweep failed");
            }
        }
    })
}

/// Re-verifies attempts stuck in a non-terminal state, expiring those whose
/// payment window has elapsed. Lost webhooks and closed browser tabs end up
/// here; the lookup still decides the outcome.
pub async fn sweep_payments(
    engine: &ReconciliationEngine,
    store: &BookingStore,
    config: &SweeperConfig,
) -> Result<(), StoreError> {
    let now = Utc::now().naive_utc();
    let recheck_cutoff = now - chrono::Duration::seconds(config.recheck_after_secs);
    let expiry_cutoff = now - chrono::Duration::seconds(config.expire_after_secs);

    let stale = store.stale_attempts(&recheck_cutoff)?;
    if stale.is_empty() {
        return Ok(());
    }
    tracing::info!(count = stale.len(), "re-verifying stale payment attempts");

    for attempt in stale {
        let external_ref = attempt.external_ref.clone();
        match engine.verify(&external_ref).await {
            Ok(outcome) => {
                if !outcome.attempt.status.is_terminal() && attempt.created_at <= expiry_cutoff {
                    if let Err(e) = engine.expire(&external_ref).await {
                        tracing::warn!(external_ref = %external_ref, error = %e, "expiry failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(external_ref = %external_ref, error = %e, "re-verify failed");
            }
        }
    }

    Ok(())
}

/// Moves confirmed bookings through their charging slot: InProgress at slot
/// start, Completed at slot end.
pub fn sweep_bookings(store: &BookingStore) -> Result<(), StoreError> {
    let now = Utc::now().naive_utc();

    let mut started = 0usize;
    for booking in store.bookings_to_start(&now)? {
        match store.transition(
            &booking.id,
            &[BookingStatus::Confirmed],
            BookingStatus::InProgress,
            booking.version,
            None,
            None,
        ) {
            Ok(_) => started += 1,
            Err(StoreError::Conflict) => {} // raced with another replica
            Err(e) => return Err(e),
        }
    }

    let mut completed = 0usize;
    for booking in store.bookings_to_complete(&now)? {
        match store.transition(
            &booking.id,
            &[BookingStatus::Confirmed, BookingStatus::InProgress],
            BookingStatus::Completed,
            booking.version,
            None,
            None,
        ) {
            Ok(_) => completed += 1,
            Err(StoreError::Conflict) => {}
            Err(e) => return Err(e),
        }
    }

    if started > 0 || completed > 0 {
        tracing::info!(started, completed, "booking slots advanced");
    }
    Ok(())
}
