use std::sync::{Arc, Mutex};

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use chargepay::config::AppConfig;
use chargepay::db::{self, BookingStore};
use chargepay::handlers;
use chargepay::services::gateways::esewa::EsewaGateway;
use chargepay::services::gateways::khalti::KhaltiGateway;
use chargepay::services::notifications::{self, LogDispatcher};
use chargepay::services::reconciliation::ReconciliationEngine;
use chargepay::services::sweeper::{self, SweeperConfig};
use chargepay::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    let conn = db::init_db(&config.database_url)?;
    let store = Arc::new(BookingStore::new(Arc::new(Mutex::new(conn))));

    let khalti = KhaltiGateway::new(
        config.khalti_base_url.clone(),
        config.khalti_secret_key.clone(),
        config.khalti_webhook_secret.clone(),
        config.khalti_return_url.clone(),
        config.khalti_website_url.clone(),
    );
    let esewa = EsewaGateway::new(
        config.esewa_form_url.clone(),
        config.esewa_status_url.clone(),
        config.esewa_product_code.clone(),
        config.esewa_secret_key.clone(),
        config.esewa_success_url.clone(),
        config.esewa_failure_url.clone(),
    );

    let engine = Arc::new(
        ReconciliationEngine::new(Arc::clone(&store))
            .with_gateway(Arc::new(khalti))
            .with_gateway(Arc::new(esewa)),
    );

    let _dispatcher = notifications::spawn_dispatcher(store.subscribe(), Arc::new(LogDispatcher));
    let _sweeper = sweeper::spawn(
        Arc::clone(&engine),
        Arc::clone(&store),
        SweeperConfig {
            interval_secs: config.sweep_interval_secs,
            recheck_after_secs: config.recheck_after_secs,
            expire_after_secs: config.expire_after_secs,
        },
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        engine,
    });

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/bookings", post(handlers::bookings::create_booking))
        .route("/bookings/:id", get(handlers::bookings::get_booking))
        .route("/bookings/:id/payments", get(handlers::bookings::list_payments))
        .route("/payments/:gateway/initiate", post(handlers::payments::initiate))
        .route("/payments/return", get(handlers::payments::payment_return))
        .route("/webhooks/:gateway", post(handlers::webhook::gateway_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
