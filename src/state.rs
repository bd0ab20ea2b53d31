use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::BookingStore;
use crate::services::reconciliation::ReconciliationEngine;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<BookingStore>,
    pub engine: Arc<ReconciliationEngine>,
}
