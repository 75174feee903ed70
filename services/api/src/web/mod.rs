pub mod middleware;
pub mod rest;
pub mod state;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use middleware::{require_admin, require_instructor};
use rest::*;
use state::AppState;

/// Builds the REST router. Ingestion routes are public, analytics and
/// ledger operations sit behind the admin token, and the `/instructors/me`
/// routes require the caller's instructor id.
pub fn router(app_state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/engagements", post(record_engagement_handler))
        .route("/engagements/{id}/complete", post(complete_session_handler));

    let instructor_routes = Router::new()
        .route("/instructors/me/payouts", get(my_payouts_handler))
        .route("/instructors/me/earnings", get(my_earnings_handler))
        .layer(axum_middleware::from_fn(require_instructor));

    let admin_routes = Router::new()
        .route("/analytics/users/{id}", get(user_analytics_handler))
        .route("/analytics/courses/{id}", get(course_analytics_handler))
        .route(
            "/analytics/instructors/{id}/{year}/{month}",
            get(instructor_breakdown_handler),
        )
        .route("/admin/engagements/fraud-statistics", get(fraud_statistics_handler))
        .route("/admin/engagements/suspicious", get(suspicious_engagements_handler))
        .route("/admin/engagements/{id}/fraud", post(flag_engagement_handler))
        .route("/admin/engagements/{id}/rescore", post(rescore_engagement_handler))
        .route("/revenue", post(record_revenue_handler))
        .route("/revenue/failures", post(record_payment_failure_handler))
        .route("/revenue/{id}/refund", post(refund_handler))
        .route("/revenue/{id}/chargeback", post(chargeback_handler))
        .route("/admin/revenue/metrics", get(revenue_metrics_handler))
        .route("/admin/revenue/monthly/{year}", get(monthly_revenue_handler))
        .route(
            "/admin/payouts/periods/{year}/{month}",
            post(calculate_period_handler).get(period_summary_handler),
        )
        .route("/admin/payouts/periods/{year}/{month}/top", get(top_earners_handler))
        .route("/admin/payouts/{id}", get(get_payout_handler))
        .route("/admin/payouts/{id}/recalculate", post(recalculate_payout_handler))
        .route("/admin/payouts/{id}/fail", post(fail_payout_handler))
        .route("/admin/payouts/{id}/retry", post(retry_payout_handler))
        .route("/admin/payouts/{id}/execute", post(execute_payout_handler))
        .route("/admin/payouts/{id}/reconcile", post(reconcile_payout_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_admin,
        ));

    Router::new()
        .merge(public_routes)
        .merge(instructor_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, TimeZone, Utc};
    use revshare_core::domain::{
        Engagement, EngagementMetadata, EngagementType, InstructorConnectAccount, OnboardingStatus,
    };
    use revshare_core::ports::{
        AccountStatus, EngagementStore, TransferError, TransferProvider, TransferReceipt,
        TransferRequest,
    };
    use revshare_core::InMemoryStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    const ADMIN: &str = "test-admin-token";

    struct AcceptingProvider;

    #[async_trait]
    impl TransferProvider for AcceptingProvider {
        async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
            Ok(TransferReceipt {
                transfer_id: format!("tr_{}", request.idempotency_key),
            })
        }

        async fn account_status(&self, _account_id: &str) -> Result<AccountStatus, TransferError> {
            Ok(AccountStatus {
                payouts_enabled: true,
                charges_enabled: true,
            })
        }
    }

    fn test_config(with_transfers: bool) -> Arc<Config> {
        Arc::new(
            Config::from_lookup(|key| match key {
                "DATABASE_URL" => Some("postgres://localhost/revshare_test".to_string()),
                "ADMIN_TOKEN" => Some(ADMIN.to_string()),
                "TRANSFER_API_KEY" if with_transfers => Some("sk_test".to_string()),
                _ => None,
            })
            .unwrap(),
        )
    }

    fn app_with(store: Arc<InMemoryStore>, with_transfers: bool) -> Router {
        let state = AppState::new(store, Arc::new(AcceptingProvider), test_config(with_transfers));
        router(Arc::new(state))
    }

    fn app() -> (Router, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (app_with(store.clone(), true), store)
    }

    fn admin_post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-admin-token", ADMIN)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn admin_get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-admin-token", ADMIN)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn decimal(value: &Value) -> Decimal {
        value.as_str().unwrap().parse().unwrap()
    }

    fn engagement_body(engagement_type: &str) -> Value {
        json!({
            "user_id": Uuid::new_v4(),
            "course_id": Uuid::new_v4(),
            "lesson_id": null,
            "engagement_type": engagement_type,
            "duration_minutes": 25,
            "started_at": Utc::now() - Duration::minutes(30),
            "completed_at": null,
            "device_fingerprint": "fp-1",
            "signals": { "tab_active_ratio": 0.9 }
        })
    }

    async fn seed_counted_minutes(store: &InMemoryStore, course_id: Uuid, minutes: u32, at: chrono::DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        store
            .insert_engagement(&Engagement {
                id,
                user_id: Uuid::new_v4(),
                course_id,
                lesson_id: None,
                engagement_type: EngagementType::VideoWatch,
                duration_minutes: minutes,
                started_at: at,
                completed_at: Some(at + Duration::minutes(minutes as i64)),
                validation_score: Some(dec!(0.95)),
                counts_for_payout: true,
                fraud_flagged: false,
                fraud_reason: None,
                fraud_flagged_at: None,
                metadata: EngagementMetadata::default(),
                validated_at: Some(at),
                created_at: at,
            })
            .await
            .unwrap();
        id
    }

    fn connect_account(instructor_id: Uuid) -> InstructorConnectAccount {
        InstructorConnectAccount {
            instructor_id,
            external_account_id: format!("acct_{}", instructor_id.simple()),
            onboarding_status: OnboardingStatus::Complete,
            payouts_enabled: true,
            charges_enabled: true,
            total_paid_out: Decimal::ZERO,
            last_payout_at: None,
            disabled_at: None,
            disabled_reason: None,
        }
    }

    #[tokio::test]
    async fn recording_an_open_engagement_returns_created() {
        let (app, _) = app();
        let req = Request::builder()
            .method("POST")
            .uri("/engagements")
            .header("content-type", "application/json")
            .body(Body::from(engagement_body("video_watch").to_string()))
            .unwrap();

        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["engagement_type"], "video_watch");
        assert_eq!(body["validation_score"], Value::Null);
        assert_eq!(body["counts_for_payout"], false);
    }

    #[tokio::test]
    async fn unknown_engagement_type_is_a_bad_request() {
        let (app, _) = app();
        let req = Request::builder()
            .method("POST")
            .uri("/engagements")
            .header("content-type", "application/json")
            .body(Body::from(engagement_body("podcast").to_string()))
            .unwrap();

        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_routes_require_the_right_token() {
        let (app, _) = app();

        let missing = Request::builder()
            .uri("/admin/engagements/fraud-statistics")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, missing).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .uri("/admin/engagements/fraud-statistics")
            .header("x-admin-token", "nope")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, wrong).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&app, admin_get("/admin/engagements/fraud-statistics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn flagged_engagement_cannot_be_rescored() {
        let (app, store) = app();
        let course_id = Uuid::new_v4();
        let id = seed_counted_minutes(&store, course_id, 30, Utc::now() - Duration::hours(2)).await;

        let (status, body) = send(
            &app,
            admin_post(&format!("/admin/engagements/{}/fraud", id), json!({ "reason": "bot traffic" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fraud_flagged"], true);
        assert_eq!(body["counts_for_payout"], false);

        let (status, _) = send(&app, admin_post(&format!("/admin/engagements/{}/rescore", id), json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn redelivered_invoice_is_not_recorded_twice() {
        let (app, store) = app();
        let paid_at = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let event = json!({
            "subscription_id": Uuid::new_v4(),
            "amount": "49.00",
            "currency": "eur",
            "invoice_id": "in_123",
            "billing_period_start": paid_at,
            "billing_period_end": paid_at + Duration::days(30),
            "paid_at": paid_at
        });

        let (status, body) = send(&app, admin_post("/revenue", event.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "created");
        assert_eq!(body["revenue"]["currency"], "EUR");

        let (status, body) = send(&app, admin_post("/revenue", event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_recorded");
        assert_eq!(store.revenue_count(), 1);
    }

    #[tokio::test]
    async fn period_payouts_split_the_pool_and_execute() {
        let (app, store) = app();
        let (alice, alice_course) = (Uuid::new_v4(), Uuid::new_v4());
        let (bob, bob_course) = (Uuid::new_v4(), Uuid::new_v4());
        store.add_course(alice_course, alice);
        store.add_course(bob_course, bob);
        store.upsert_connect_account(connect_account(alice));
        store.upsert_connect_account(connect_account(bob));

        let mid_june = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
        seed_counted_minutes(&store, alice_course, 300, mid_june).await;
        seed_counted_minutes(&store, bob_course, 700, mid_june).await;

        let (status, _) = send(
            &app,
            admin_post(
                "/revenue",
                json!({
                    "subscription_id": Uuid::new_v4(),
                    "amount": "10000",
                    "currency": "EUR",
                    "invoice_id": "in_june",
                    "billing_period_start": mid_june,
                    "billing_period_end": mid_june + Duration::days(30),
                    "paid_at": mid_june
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, admin_post("/admin/payouts/periods/2024/6", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let payouts = body.as_array().unwrap();
        assert_eq!(payouts.len(), 2);
        let amount_for = |instructor: Uuid| {
            payouts
                .iter()
                .find(|p| p["instructor_id"] == json!(instructor))
                .map(|p| (decimal(&p["payout_amount"]), p["id"].as_str().unwrap().to_string()))
                .unwrap()
        };
        let (alice_amount, alice_payout) = amount_for(alice);
        let (bob_amount, _) = amount_for(bob);
        assert_eq!(alice_amount, dec!(2400));
        assert_eq!(bob_amount, dec!(5600));

        let (status, body) = send(&app, admin_post(&format!("/admin/payouts/{}/execute", alice_payout), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "paid");
        assert!(body["transfer_id"].as_str().unwrap().starts_with("tr_"));

        let earnings = Request::builder()
            .uri("/instructors/me/earnings")
            .header("x-instructor-id", alice.to_string())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, earnings).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&body["total_earned"]), dec!(2400));
    }

    #[tokio::test]
    async fn execution_is_refused_without_a_transfer_key() {
        let store = Arc::new(InMemoryStore::new());
        let app = app_with(store, false);

        let (status, _) = send(
            &app,
            admin_post(&format!("/admin/payouts/{}/execute", Uuid::new_v4()), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn instructor_routes_need_an_instructor_id() {
        let (app, _) = app();
        let req = Request::builder()
            .uri("/instructors/me/payouts")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/instructors/me/payouts?page=1&page_size=5")
            .header("x-instructor-id", Uuid::new_v4().to_string())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["page_size"], 5);
        assert_eq!(body["payouts"], json!([]));
    }

    #[tokio::test]
    async fn unknown_payout_is_not_found() {
        let (app, _) = app();
        let (status, _) = send(&app, admin_get(&format!("/admin/payouts/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
