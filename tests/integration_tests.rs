use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::sync::broadcast;
use tower::ServiceExt;

use chargepay::config::AppConfig;
use chargepay::db::{self, BookingStore, NewBooking};
use chargepay::handlers;
use chargepay::models::{
    AttemptStatus, Booking, BookingStatus, Gateway, PaymentAttempt, StatusChange,
};
use chargepay::services::gateways::{
    GatewayError, GatewayLookup, GatewayPaymentStatus, InitiatedPayment, PaymentGateway,
};
use chargepay::services::reconciliation::{ReconciliationEngine, RetryPolicy};
use chargepay::services::sweeper::{self, SweeperConfig};
use chargepay::state::AppState;

const MOCK_SECRET: &str = "mock-signature-secret";

// ── Mock gateway ──

#[derive(Clone, Copy)]
enum Scripted {
    Ok(GatewayPaymentStatus, Option<i64>),
    Transient,
}

struct MockGateway {
    secret: String,
    lookup_calls: AtomicUsize,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
}

impl MockGateway {
    fn with_fallback(fallback: Scripted) -> Arc<Self> {
        Arc::new(Self {
            secret: MOCK_SECRET.to_string(),
            lookup_calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback,
        })
    }

    fn enqueue(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    fn lookups(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> Gateway {
        Gateway::Khalti
    }

    async fn initiate(
        &self,
        _booking: &Booking,
        external_ref_hint: &str,
    ) -> Result<InitiatedPayment, GatewayError> {
        Ok(InitiatedPayment {
            external_ref: external_ref_hint.to_string(),
            redirect_url: format!("https://pay.example.com/{external_ref_hint}"),
            form_payload: None,
        })
    }

    async fn lookup(&self, attempt: &PaymentAttempt) -> Result<GatewayLookup, GatewayError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match step {
            Scripted::Ok(status, amount) => Ok(GatewayLookup {
                status,
                amount: amount.unwrap_or(attempt.amount),
                verified_at: Utc::now().naive_utc(),
            }),
            Scripted::Transient => Err(GatewayError::Api {
                status: 503,
                body: "gateway unavailable".into(),
            }),
        }
    }

    fn verify_signature(&self, _raw_payload: &[u8], headers: &HeaderMap) -> bool {
        headers
            .get("x-mock-signature")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == self.secret)
            .unwrap_or(false)
    }

    fn external_ref_from_webhook(&self, raw_payload: &[u8]) -> Option<String> {
        let data: serde_json::Value = serde_json::from_slice(raw_payload).ok()?;
        data["ref"].as_str().map(|s| s.to_string())
    }
}

// ── Helpers ──

fn test_state(mock: Arc<MockGateway>) -> Arc<AppState> {
    let conn = db::init_db(":memory:").unwrap();
    let store = Arc::new(BookingStore::new(Arc::new(Mutex::new(conn))));
    let engine = Arc::new(
        ReconciliationEngine::new(Arc::clone(&store))
            .with_gateway(mock)
            .with_retry(RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            }),
    );
    Arc::new(AppState {
        config: AppConfig::from_env(),
        store,
        engine,
    })
}

fn app(state: &Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/bookings", post(handlers::bookings::create_booking))
        .route("/bookings/:id", get(handlers::bookings::get_booking))
        .route("/bookings/:id/payments", get(handlers::bookings::list_payments))
        .route("/payments/:gateway/initiate", post(handlers::payments::initiate))
        .route("/payments/return", get(handlers::payments::payment_return))
        .route("/webhooks/:gateway", post(handlers::webhook::gateway_webhook))
        .with_state(Arc::clone(state))
}

fn make_booking(state: &Arc<AppState>) -> Booking {
    let now = Utc::now().naive_utc();
    state
        .store
        .create_booking(NewBooking {
            user_id: "user-1".into(),
            station_id: "station-9".into(),
            charger_id: "charger-2".into(),
            slot_start: now + chrono::Duration::hours(1),
            slot_end: now + chrono::Duration::hours(2),
            amount: 150,
            currency: "NPR".into(),
        })
        .unwrap()
}

async fn initiated_ref(state: &Arc<AppState>, booking: &Booking) -> String {
    state
        .engine
        .initiate(&booking.id, Gateway::Khalti)
        .await
        .unwrap()
        .attempt
        .external_ref
}

fn webhook_request(external_ref: &str, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/khalti")
        .header("Content-Type", "application/json")
        .header("x-mock-signature", signature)
        .body(Body::from(format!(
            r#"{{"ref":"{external_ref}","status":"Completed"}}"#
        )))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn drain_confirmations(rx: &mut broadcast::Receiver<StatusChange>) -> usize {
    let mut confirmed = 0;
    while let Ok(change) = rx.try_recv() {
        if change.to == BookingStatus::Confirmed {
            confirmed += 1;
        }
    }
    confirmed
}

// ── Booking surface ──

#[tokio::test]
async fn create_and_read_booking_over_http() {
    let state = test_state(MockGateway::with_fallback(Scripted::Ok(
        GatewayPaymentStatus::Pending,
        None,
    )));

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/bookings")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    r#"{
                        "user_id": "user-1",
                        "station_id": "station-9",
                        "charger_id": "charger-2",
                        "slot_start": "2026-09-01T10:00:00",
                        "slot_end": "2026-09-01T11:00:00",
                        "amount": 150
                    }"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    assert_eq!(created["status"], "pending");
    assert_eq!(created["currency"], "NPR");

    let id = created["id"].as_str().unwrap();
    let response = app(&state)
        .oneshot(
            Request::builder()
                .uri(format!("/bookings/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = json_body(response).await;
    assert_eq!(fetched["status"], "pending");
    // the read surface never carries gateway payloads
    assert!(fetched.get("raw_callback_payload").is_none());
}

#[tokio::test]
async fn rejects_booking_with_inverted_slot() {
    let state = test_state(MockGateway::with_fallback(Scripted::Ok(
        GatewayPaymentStatus::Pending,
        None,
    )));

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/bookings")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    r#"{
                        "user_id": "user-1",
                        "station_id": "station-9",
                        "charger_id": "charger-2",
                        "slot_start": "2026-09-01T11:00:00",
                        "slot_end": "2026-09-01T10:00:00",
                        "amount": 150
                    }"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ── Initiation ──

#[tokio::test]
async fn initiate_marks_booking_awaiting_payment() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Pending, None));
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/khalti/initiate")
                .header("Content-Type", "application/json")
                .body(Body::from(format!(r#"{{"booking_id":"{}"}}"#, booking.id)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["attempt_number"], 1);
    assert!(body["redirect_url"].as_str().unwrap().starts_with("https://pay.example.com/"));

    let booking = state.store.booking(&booking.id).unwrap();
    assert_eq!(booking.status, BookingStatus::AwaitingPayment);
    assert!(booking.active_attempt_id.is_some());
    // initiation registers the attempt, it does not look anything up
    assert_eq!(mock.lookups(), 0);
}

#[tokio::test]
async fn second_initiate_conflicts_while_attempt_is_live() {
    let mock = MockGateway::with_fallback(Scripted::Transient);
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/khalti/initiate")
                .header("Content-Type", "application/json")
                .body(Body::from(format!(r#"{{"booking_id":"{}"}}"#, booking.id)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // once the attempt dies, a fresh one is allowed and numbered correctly
    state.engine.verify(&external_ref).await.unwrap();
    let booking = state.store.booking(&booking.id).unwrap();
    assert_eq!(booking.status, BookingStatus::PaymentFailed);

    let outcome = state.engine.initiate(&booking.id, Gateway::Khalti).await.unwrap();
    assert_eq!(outcome.attempt.attempt_number, 2);
    assert_eq!(outcome.booking.status, BookingStatus::AwaitingPayment);
}

#[tokio::test]
async fn initiate_on_unknown_gateway_is_404() {
    let state = test_state(MockGateway::with_fallback(Scripted::Transient));
    let booking = make_booking(&state);

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/stripe/initiate")
                .header("Content-Type", "application/json")
                .body(Body::from(format!(r#"{{"booking_id":"{}"}}"#, booking.id)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ── Reconciliation scenarios ──

#[tokio::test]
async fn webhook_then_redirect_settle_exactly_once() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, None));
    let state = test_state(Arc::clone(&mock));
    let mut events = state.store.subscribe();
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let response = app(&state)
        .oneshot(webhook_request(&external_ref, MOCK_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "succeeded");

    // the late redirect is a no-op answered from the store
    let response = app(&state)
        .oneshot(
            Request::builder()
                .uri(format!("/payments/return?pidx={external_ref}&status=Completed"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["booking_status"], "confirmed");

    assert_eq!(mock.lookups(), 1);
    assert_eq!(drain_confirmations(&mut events), 1);

    // webhook body was kept for audit
    let attempt = state.store.attempt_by_ref(&external_ref).unwrap().unwrap();
    assert!(attempt.raw_callback_payload.unwrap().contains(&external_ref));
}

#[tokio::test]
async fn pending_redirect_then_sweeper_confirms() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, None));
    mock.enqueue(Scripted::Ok(GatewayPaymentStatus::Pending, None));
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    // the user comes back while the gateway still says pending
    let response = app(&state)
        .oneshot(
            Request::builder()
                .uri(format!("/payments/return?pidx={external_ref}&status=Pending"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "pending");
    let current = state.store.booking(&booking.id).unwrap();
    assert_eq!(current.status, BookingStatus::AwaitingPayment);

    // the scheduled re-check later finds the payment completed
    let config = SweeperConfig {
        interval_secs: 1,
        recheck_after_secs: 0,
        expire_after_secs: 3600,
    };
    sweeper::sweep_payments(&state.engine, &state.store, &config)
        .await
        .unwrap();

    let current = state.store.booking(&booking.id).unwrap();
    assert_eq!(current.status, BookingStatus::Confirmed);
    assert_eq!(mock.lookups(), 2);
}

#[tokio::test]
async fn lookup_exhaustion_expires_attempt() {
    let mock = MockGateway::with_fallback(Scripted::Transient);
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let outcome = state.engine.verify(&external_ref).await.unwrap();
    assert_eq!(outcome.attempt.status, AttemptStatus::Expired);
    assert_eq!(outcome.booking.status, BookingStatus::PaymentFailed);
    assert_eq!(outcome.user_facing(), "failed");
    // bounded retry: exactly the configured number of tries
    assert_eq!(mock.lookups(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_verifies_confirm_exactly_once() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, None));
    let state = test_state(Arc::clone(&mock));
    let mut events = state.store.subscribe();
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine = Arc::clone(&state.engine);
        let external_ref = external_ref.clone();
        handles.push(tokio::spawn(async move {
            engine.verify(&external_ref).await.unwrap()
        }));
    }

    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.user_facing(), "succeeded");
        assert_eq!(outcome.booking.status, BookingStatus::Confirmed);
    }

    assert_eq!(mock.lookups(), 1);
    assert_eq!(drain_confirmations(&mut events), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn webhook_storm_confirms_exactly_once() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, None));
    let state = test_state(Arc::clone(&mock));
    let mut events = state.store.subscribe();
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let router = app(&state);
    let mut handles = Vec::new();
    for _ in 0..200 {
        let router = router.clone();
        let external_ref = external_ref.clone();
        handles.push(tokio::spawn(async move {
            router
                .oneshot(webhook_request(&external_ref, MOCK_SECRET))
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "succeeded");
    }

    assert_eq!(mock.lookups(), 1);
    assert_eq!(drain_confirmations(&mut events), 1);
    let booking = state.store.booking(&booking.id).unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
}

// ── Claims are never truth ──

#[tokio::test]
async fn claimed_completion_alone_never_confirms() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Pending, None));
    let state = test_state(Arc::clone(&mock));
    let mut events = state.store.subscribe();
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    // both callbacks loudly claim completion; the lookup says pending
    let response = app(&state)
        .oneshot(webhook_request(&external_ref, MOCK_SECRET))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "pending");

    let response = app(&state)
        .oneshot(
            Request::builder()
                .uri(format!("/payments/return?pidx={external_ref}&status=Completed"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "pending");

    let booking = state.store.booking(&booking.id).unwrap();
    assert_eq!(booking.status, BookingStatus::AwaitingPayment);
    assert_eq!(drain_confirmations(&mut events), 0);
}

#[tokio::test]
async fn invalid_signature_is_rejected_without_lookup() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, None));
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let response = app(&state)
        .oneshot(webhook_request(&external_ref, "forged"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/khalti")
                .header("Content-Type", "application/json")
                .body(Body::from(format!(r#"{{"ref":"{external_ref}"}}"#)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    assert_eq!(mock.lookups(), 0);
    let booking = state.store.booking(&booking.id).unwrap();
    assert_eq!(booking.status, BookingStatus::AwaitingPayment);
    let attempt = state.store.attempt_by_ref(&external_ref).unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Initiated);
    assert!(attempt.raw_callback_payload.is_none());
}

#[tokio::test]
async fn missing_return_reference_is_rejected() {
    let state = test_state(MockGateway::with_fallback(Scripted::Transient));

    let response = app(&state)
        .oneshot(
            Request::builder()
                .uri("/payments/return?status=Completed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "missing payment reference");
}

#[tokio::test]
async fn unknown_reference_is_reported_not_processed() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, None));
    let state = test_state(Arc::clone(&mock));

    let response = app(&state)
        .oneshot(webhook_request("PX-never-issued", MOCK_SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(mock.lookups(), 0);
}

// ── Idempotence and terminal immutability ──

#[tokio::test]
async fn terminal_attempts_answer_from_the_store() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, None));
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let first = state.engine.verify(&external_ref).await.unwrap();
    assert_eq!(first.booking.status, BookingStatus::Confirmed);
    assert_eq!(mock.lookups(), 1);

    // even a lookup that would now disagree is never made
    mock.enqueue(Scripted::Ok(GatewayPaymentStatus::UserCanceled, None));

    let second = state.engine.verify(&external_ref).await.unwrap();
    assert_eq!(second.booking.status, BookingStatus::Confirmed);
    assert_eq!(second.attempt.status, first.attempt.status);
    assert_eq!(mock.lookups(), 1);

    // expiry is likewise absorbed by the terminal state
    let expired = state.engine.expire(&external_ref).await.unwrap();
    assert_eq!(expired.booking.status, BookingStatus::Confirmed);
    assert_eq!(expired.attempt.status, AttemptStatus::Completed);

    let response = app(&state)
        .oneshot(webhook_request(&external_ref, MOCK_SECRET))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "succeeded");
    assert_eq!(mock.lookups(), 1);
}

// ── Outcome mapping ──

#[tokio::test]
async fn user_cancellation_cancels_the_booking() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::UserCanceled, None));
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let response = app(&state)
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/payments/return?pidx={external_ref}&status=User%20canceled"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "canceled");

    let booking = state.store.booking(&booking.id).unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn amount_mismatch_never_confirms() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, Some(1)));
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    let outcome = state.engine.verify(&external_ref).await.unwrap();
    assert_eq!(outcome.attempt.status, AttemptStatus::Failed);
    assert_eq!(outcome.booking.status, BookingStatus::PaymentFailed);
    assert!(outcome
        .attempt
        .failure_reason
        .unwrap()
        .contains("amount mismatch"));
}

// ── Expiry window ──

#[tokio::test]
async fn stuck_attempt_expires_only_after_the_window() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Pending, None));
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);
    let external_ref = initiated_ref(&state, &booking).await;

    // inside the window: re-verified, left alive
    let config = SweeperConfig {
        interval_secs: 1,
        recheck_after_secs: 0,
        expire_after_secs: 3600,
    };
    sweeper::sweep_payments(&state.engine, &state.store, &config)
        .await
        .unwrap();
    let current = state.store.booking(&booking.id).unwrap();
    assert_eq!(current.status, BookingStatus::AwaitingPayment);

    // window elapsed: one final re-verify, then expiry
    let config = SweeperConfig {
        interval_secs: 1,
        recheck_after_secs: 0,
        expire_after_secs: 0,
    };
    sweeper::sweep_payments(&state.engine, &state.store, &config)
        .await
        .unwrap();

    let current = state.store.booking(&booking.id).unwrap();
    assert_eq!(current.status, BookingStatus::PaymentFailed);
    let attempt = state.store.attempt_by_ref(&external_ref).unwrap().unwrap();
    assert_eq!(attempt.status, AttemptStatus::Expired);
}

// ── Slot lifecycle ──

#[tokio::test]
async fn confirmed_bookings_move_through_their_slot() {
    let mock = MockGateway::with_fallback(Scripted::Ok(GatewayPaymentStatus::Completed, None));
    let state = test_state(Arc::clone(&mock));
    let now = Utc::now().naive_utc();

    let running = state
        .store
        .create_booking(NewBooking {
            user_id: "user-1".into(),
            station_id: "station-9".into(),
            charger_id: "charger-2".into(),
            slot_start: now - chrono::Duration::minutes(10),
            slot_end: now + chrono::Duration::hours(1),
            amount: 150,
            currency: "NPR".into(),
        })
        .unwrap();
    let finished = state
        .store
        .create_booking(NewBooking {
            user_id: "user-2".into(),
            station_id: "station-9".into(),
            charger_id: "charger-3".into(),
            slot_start: now - chrono::Duration::hours(2),
            slot_end: now - chrono::Duration::hours(1),
            amount: 200,
            currency: "NPR".into(),
        })
        .unwrap();

    for booking in [&running, &finished] {
        let external_ref = initiated_ref(&state, booking).await;
        state.engine.verify(&external_ref).await.unwrap();
    }

    sweeper::sweep_bookings(&state.store).unwrap();

    assert_eq!(
        state.store.booking(&running.id).unwrap().status,
        BookingStatus::InProgress
    );
    assert_eq!(
        state.store.booking(&finished.id).unwrap().status,
        BookingStatus::Completed
    );
}

// ── Audit surface ──

#[tokio::test]
async fn attempt_history_lists_newest_first() {
    let mock = MockGateway::with_fallback(Scripted::Transient);
    let state = test_state(Arc::clone(&mock));
    let booking = make_booking(&state);

    // first attempt dies, second is live
    let first_ref = initiated_ref(&state, &booking).await;
    state.engine.verify(&first_ref).await.unwrap();
    state
        .engine
        .initiate(&booking.id, Gateway::Khalti)
        .await
        .unwrap();

    let response = app(&state)
        .oneshot(
            Request::builder()
                .uri(format!("/bookings/{}/payments", booking.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let attempts = json_body(response).await;
    let attempts = attempts.as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["attempt_number"], 2);
    assert_eq!(attempts[0]["status"], "initiated");
    assert_eq!(attempts[1]["attempt_number"], 1);
    assert_eq!(attempts[1]["status"], "expired");
}
