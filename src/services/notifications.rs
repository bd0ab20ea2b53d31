use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::StatusChange;

/// External collaborator that tells users and dashboards about booking
/// status changes. Consumed here, implemented elsewhere.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn booking_status_changed(&self, change: &StatusChange) -> anyhow::Result<()>;
}

/// Default dispatcher: structured log lines.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn booking_status_changed(&self, change: &StatusChange) -> anyhow::Result<()> {
        tracing::info!(
            booking_id = %change.booking_id,
            from = change.from.as_str(),
            to = change.to.as_str(),
            "booking status changed"
        );
        Ok(())
    }
}

/// Drains the store's status-change channel into a dispatcher. Dispatch
/// failures are logged and dropped; a notification must never block or fail
/// a transition that already committed.
pub fn spawn_dispatcher(
    mut rx: broadcast::Receiver<StatusChange>,
    dispatcher: Arc<dyn NotificationDispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    if let Err(e) = dispatcher.booking_status_changed(&change).await {
                        tracing::error!(
                            booking_id = %change.booking_id,
                            error = %e,
                            "failed to dispatch status change"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "notification dispatcher lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
