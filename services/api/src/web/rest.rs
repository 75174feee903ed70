//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::middleware::InstructorId;
use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Duration, Utc};
use revshare_core::domain::{
    AccountingPeriod, CourseEngagementDetail, Engagement, EngagementMetadata, EngagementType, InstructorPayout,
    SessionSignals, SubscriptionRevenue,
};
use revshare_core::engagement::{
    CourseEngagementAnalytics, EngagementTotals, FraudStatistics, InstructorAttribution,
    UserEngagementAnalytics,
};
use revshare_core::executor::ExecutionOutcome;
use revshare_core::payout::{
    InstructorEarnings, InstructorPayoutEntry, PayoutPeriodSummary, PayoutStatement,
};
use revshare_core::revenue::{MonthlyRevenue, PaymentFailureEvent, RevenueEvent, RevenueMetrics};
use revshare_core::{EngagementReport, RecordOutcome, ServiceError, SessionCompletion};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        record_engagement_handler,
        complete_session_handler,
        user_analytics_handler,
        course_analytics_handler,
        instructor_breakdown_handler,
        fraud_statistics_handler,
        suspicious_engagements_handler,
        flag_engagement_handler,
        rescore_engagement_handler,
        record_revenue_handler,
        record_payment_failure_handler,
        refund_handler,
        chargeback_handler,
        revenue_metrics_handler,
        monthly_revenue_handler,
        calculate_period_handler,
        period_summary_handler,
        top_earners_handler,
        get_payout_handler,
        recalculate_payout_handler,
        fail_payout_handler,
        retry_payout_handler,
        execute_payout_handler,
        reconcile_payout_handler,
        my_payouts_handler,
        my_earnings_handler,
    ),
    components(
        schemas(
            RecordEngagementRequest, CompleteSessionRequest, SignalsPayload, EngagementResponse,
            TotalsResponse, UserAnalyticsResponse, CourseAnalyticsResponse, FraudStatisticsResponse,
            InstructorBreakdownResponse,
            FlagEngagementRequest, RevenueRequest, PaymentFailureRequest, ReversalRequest,
            RevenueResponse, RecordRevenueResponse, RevenueMetricsResponse, MonthlyRevenueResponse,
            PayoutResponse, CourseDetailResponse, PayoutSummaryResponse, InstructorEarningsResponse,
            FailPayoutRequest, ReconcileRequest, ExecutionResponse, InstructorPayoutResponse,
            PayoutStatementResponse, EarningsTotalResponse
        )
    ),
    tags(
        (name = "Revenue Share API", description = "Engagement tracking, revenue ledger and instructor payouts.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Error mapping
//=========================================================================================

type HandlerError = (StatusCode, String);

/// Maps a core service error to a response. Server-side failures are logged
/// and their detail withheld from the caller.
fn service_error(e: ServiceError) -> HandlerError {
    let status = match &e {
        ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ServiceError::Port(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {:?}", e);
        (status, "Internal server error".to_string())
    } else {
        (status, e.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> HandlerError {
    (StatusCode::BAD_REQUEST, message.into())
}

//=========================================================================================
// Engagement payloads
//=========================================================================================

/// Client-reported session signals. Every field is optional while a session streams.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct SignalsPayload {
    pub tab_active_ratio: Option<f64>,
    pub playback_speed: Option<f64>,
    pub session_seconds: Option<f64>,
    pub content_seconds: Option<f64>,
}

impl From<SignalsPayload> for SessionSignals {
    fn from(p: SignalsPayload) -> Self {
        Self {
            tab_active_ratio: p.tab_active_ratio,
            playback_speed: p.playback_speed,
            session_seconds: p.session_seconds,
            content_seconds: p.content_seconds,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordEngagementRequest {
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub lesson_id: Option<Uuid>,
    /// One of `video_watch`, `quiz_attempt`, `assignment_submit`, `reading`, `discussion`.
    pub engagement_type: String,
    pub duration_minutes: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    #[serde(default)]
    pub signals: SignalsPayload,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CompleteSessionRequest {
    pub completed_at: DateTime<Utc>,
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub signals: SignalsPayload,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FlagEngagementRequest {
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EngagementResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub lesson_id: Option<Uuid>,
    pub engagement_type: String,
    pub duration_minutes: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Absent while scoring is pending.
    pub validation_score: Option<Decimal>,
    pub counts_for_payout: bool,
    pub fraud_flagged: bool,
    pub fraud_reason: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
}

impl From<Engagement> for EngagementResponse {
    fn from(e: Engagement) -> Self {
        Self {
            id: e.id,
            user_id: e.user_id,
            course_id: e.course_id,
            lesson_id: e.lesson_id,
            engagement_type: e.engagement_type.as_str().to_string(),
            duration_minutes: e.duration_minutes,
            started_at: e.started_at,
            completed_at: e.completed_at,
            validation_score: e.validation_score,
            counts_for_payout: e.counts_for_payout,
            fraud_flagged: e.fraud_flagged,
            fraud_reason: e.fraud_reason,
            validated_at: e.validated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TotalsResponse {
    pub total_engagements: u32,
    pub validated_engagements: u32,
    pub total_minutes: i64,
    pub validated_minutes: i64,
    pub average_score: Option<Decimal>,
    pub minutes_by_type: BTreeMap<String, i64>,
}

impl From<EngagementTotals> for TotalsResponse {
    fn from(t: EngagementTotals) -> Self {
        Self {
            total_engagements: t.total_engagements,
            validated_engagements: t.validated_engagements,
            total_minutes: t.total_minutes,
            validated_minutes: t.validated_minutes,
            average_score: t.average_score,
            minutes_by_type: t
                .minutes_by_type
                .into_iter()
                .map(|(kind, minutes)| (kind.as_str().to_string(), minutes))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserAnalyticsResponse {
    pub user_id: Uuid,
    pub unique_courses: u32,
    pub totals: TotalsResponse,
}

impl From<UserEngagementAnalytics> for UserAnalyticsResponse {
    fn from(a: UserEngagementAnalytics) -> Self {
        Self {
            user_id: a.user_id,
            unique_courses: a.unique_courses,
            totals: a.totals.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CourseAnalyticsResponse {
    pub course_id: Uuid,
    pub unique_users: u32,
    pub totals: TotalsResponse,
}

impl From<CourseEngagementAnalytics> for CourseAnalyticsResponse {
    fn from(a: CourseEngagementAnalytics) -> Self {
        Self {
            course_id: a.course_id,
            unique_users: a.unique_users,
            totals: a.totals.into(),
        }
    }
}

/// Validated minutes attributed to one instructor for a month.
#[derive(Debug, Serialize, ToSchema)]
pub struct InstructorBreakdownResponse {
    pub instructor_id: Uuid,
    pub year: i32,
    pub month: u32,
    pub validated_minutes: i64,
    pub unique_students: u32,
    pub engagements: u32,
    pub courses: Vec<CourseDetailResponse>,
}

impl InstructorBreakdownResponse {
    fn new(instructor_id: Uuid, period: AccountingPeriod, attribution: InstructorAttribution) -> Self {
        Self {
            instructor_id,
            year: period.year,
            month: period.month,
            validated_minutes: attribution.minutes,
            unique_students: attribution.breakdown.unique_students,
            engagements: attribution.breakdown.engagements,
            courses: attribution.breakdown.courses.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FraudStatisticsResponse {
    pub total: u32,
    pub validated: u32,
    pub pending: u32,
    pub suspicious: u32,
    pub flagged: u32,
    pub average_score: Option<Decimal>,
    pub fraud_rate: Decimal,
}

impl From<FraudStatistics> for FraudStatisticsResponse {
    fn from(s: FraudStatistics) -> Self {
        Self {
            total: s.total,
            validated: s.validated,
            pending: s.pending,
            suspicious: s.suspicious,
            flagged: s.flagged,
            average_score: s.average_score,
            fraud_rate: s.fraud_rate,
        }
    }
}

/// Half-open `[from, before)` window on engagement start; defaults to the last 30 days.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl RangeQuery {
    fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), HandlerError> {
        let before = self.before.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(before - Duration::days(30));
        if from >= before {
            return Err(bad_request("`from` must be earlier than `before`"));
        }
        Ok((from, before))
    }
}

//=========================================================================================
// Revenue payloads
//=========================================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevenueRequest {
    pub subscription_id: Uuid,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub currency: String,
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub payment_method: Option<String>,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PaymentFailureRequest {
    pub subscription_id: Uuid,
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub currency: String,
    pub invoice_id: String,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReversalRequest {
    #[schema(value_type = String)]
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevenueResponse {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub invoice_id: Option<String>,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refund_amount: Option<Decimal>,
    pub refund_reason: Option<String>,
}

impl From<SubscriptionRevenue> for RevenueResponse {
    fn from(r: SubscriptionRevenue) -> Self {
        Self {
            id: r.id,
            subscription_id: r.subscription_id,
            amount: r.amount,
            currency: r.currency,
            invoice_id: r.invoice_id,
            status: r.status.as_str().to_string(),
            paid_at: r.paid_at,
            failed_at: r.failed_at,
            failure_reason: r.failure_reason,
            refunded_at: r.refunded_at,
            refund_amount: r.refund_amount,
            refund_reason: r.refund_reason,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecordRevenueResponse {
    /// `created`, `already_recorded` or `status_changed`.
    pub outcome: String,
    pub revenue: RevenueResponse,
}

fn outcome_response(outcome: RecordOutcome) -> (StatusCode, Json<RecordRevenueResponse>) {
    let (status, label, revenue) = match outcome {
        RecordOutcome::Created(r) => (StatusCode::CREATED, "created", r),
        RecordOutcome::AlreadyRecorded(r) => (StatusCode::OK, "already_recorded", r),
        RecordOutcome::StatusChanged(r) => (StatusCode::OK, "status_changed", r),
    };
    (
        status,
        Json(RecordRevenueResponse {
            outcome: label.to_string(),
            revenue: revenue.into(),
        }),
    )
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct MetricsQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevenueMetricsResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_revenue: Decimal,
    pub previous_period_revenue: Decimal,
    /// Percent change against the preceding window of equal length.
    pub growth_rate: Decimal,
    pub mrr: Decimal,
    pub arr: Decimal,
    pub transaction_count: i64,
    pub failed_count: i64,
    pub refunded_count: i64,
    pub charged_back_count: i64,
    pub average_transaction_value: Decimal,
    #[schema(value_type = Object)]
    pub revenue_by_plan: BTreeMap<String, Decimal>,
}

impl From<RevenueMetrics> for RevenueMetricsResponse {
    fn from(m: RevenueMetrics) -> Self {
        Self {
            start: m.start,
            end: m.end,
            total_revenue: m.total_revenue,
            previous_period_revenue: m.previous_period_revenue,
            growth_rate: m.growth_rate,
            mrr: m.mrr,
            arr: m.arr,
            transaction_count: m.transaction_count,
            failed_count: m.failed_count,
            refunded_count: m.refunded_count,
            charged_back_count: m.charged_back_count,
            average_transaction_value: m.average_transaction_value,
            revenue_by_plan: m.revenue_by_plan,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MonthlyRevenueResponse {
    pub year: i32,
    pub month: u32,
    pub total_revenue: Decimal,
    pub transaction_count: i64,
    pub average_transaction_value: Decimal,
    pub failed_payments: i64,
    pub mrr: Decimal,
}

impl From<MonthlyRevenue> for MonthlyRevenueResponse {
    fn from(m: MonthlyRevenue) -> Self {
        Self {
            year: m.period.year,
            month: m.period.month,
            total_revenue: m.total_revenue,
            transaction_count: m.transaction_count,
            average_transaction_value: m.average_transaction_value,
            failed_payments: m.failed_payments,
            mrr: m.mrr,
        }
    }
}

//=========================================================================================
// Payout payloads
//=========================================================================================

#[derive(Debug, Serialize, ToSchema)]
pub struct CourseDetailResponse {
    pub course_id: Uuid,
    pub validated_minutes: i64,
    pub unique_students: u32,
    pub engagements: u32,
}

impl From<CourseEngagementDetail> for CourseDetailResponse {
    fn from(c: CourseEngagementDetail) -> Self {
        Self {
            course_id: c.course_id,
            validated_minutes: c.validated_minutes,
            unique_students: c.unique_students,
            engagements: c.engagements,
        }
    }
}

/// The admin view of a payout, including platform-wide figures.
#[derive(Debug, Serialize, ToSchema)]
pub struct PayoutResponse {
    pub id: Uuid,
    pub instructor_id: Uuid,
    pub year: i32,
    pub month: u32,
    pub instructor_minutes: i64,
    pub platform_minutes: i64,
    pub platform_revenue: Decimal,
    pub engagement_percentage: Decimal,
    pub commission_rate: Decimal,
    pub payout_amount: Decimal,
    pub currency: String,
    pub status: String,
    pub transfer_id: Option<String>,
    pub error_message: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub unique_students: u32,
    pub courses: Vec<CourseDetailResponse>,
}

impl From<InstructorPayout> for PayoutResponse {
    fn from(p: InstructorPayout) -> Self {
        let calc = p.calculation;
        Self {
            id: p.id,
            instructor_id: p.instructor_id,
            year: p.period.year,
            month: p.period.month,
            instructor_minutes: calc.instructor_minutes,
            platform_minutes: calc.platform_minutes,
            platform_revenue: calc.platform_revenue,
            engagement_percentage: calc.engagement_percentage,
            commission_rate: calc.commission_rate,
            payout_amount: calc.payout_amount,
            currency: p.currency,
            status: p.status.as_str().to_string(),
            transfer_id: p.transfer_id,
            error_message: p.error_message,
            paid_at: p.paid_at,
            failed_at: p.failed_at,
            unique_students: calc.breakdown.unique_students,
            courses: calc.breakdown.courses.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PayoutSummaryResponse {
    pub year: i32,
    pub month: u32,
    pub total_revenue: Decimal,
    pub platform_commission: Decimal,
    pub total_instructor_payouts: Decimal,
    pub total_platform_minutes: i64,
    pub total_instructors: u32,
    pub payouts_pending: u32,
    pub payouts_processing: u32,
    pub payouts_paid: u32,
    pub payouts_failed: u32,
}

impl From<PayoutPeriodSummary> for PayoutSummaryResponse {
    fn from(s: PayoutPeriodSummary) -> Self {
        Self {
            year: s.period.year,
            month: s.period.month,
            total_revenue: s.total_revenue,
            platform_commission: s.platform_commission,
            total_instructor_payouts: s.total_instructor_payouts,
            total_platform_minutes: s.total_platform_minutes,
            total_instructors: s.total_instructors,
            payouts_pending: s.payouts_pending,
            payouts_processing: s.payouts_processing,
            payouts_paid: s.payouts_paid,
            payouts_failed: s.payouts_failed,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InstructorEarningsResponse {
    pub instructor_id: Uuid,
    pub payout_amount: Decimal,
    pub engagement_minutes: i64,
    pub engagement_percentage: Decimal,
    pub unique_students: u32,
    pub courses_with_engagement: u32,
}

impl From<InstructorEarnings> for InstructorEarningsResponse {
    fn from(e: InstructorEarnings) -> Self {
        Self {
            instructor_id: e.instructor_id,
            payout_amount: e.payout_amount,
            engagement_minutes: e.engagement_minutes,
            engagement_percentage: e.engagement_percentage,
            unique_students: e.unique_students,
            courses_with_engagement: e.courses_with_engagement,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TopQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FailPayoutRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReconcileRequest {
    pub transfer_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExecutionResponse {
    /// `paid`, `failed`, `outcome_unknown`, `deferred` or `transfer_unrecorded`.
    pub outcome: String,
    pub transfer_id: Option<String>,
    pub reason: Option<String>,
}

impl From<ExecutionOutcome> for ExecutionResponse {
    fn from(o: ExecutionOutcome) -> Self {
        let (outcome, transfer_id, reason) = match o {
            ExecutionOutcome::Paid { transfer_id } => ("paid", transfer_id, None),
            ExecutionOutcome::Failed { reason } => ("failed", None, Some(reason)),
            ExecutionOutcome::OutcomeUnknown { reason } => ("outcome_unknown", None, Some(reason)),
            ExecutionOutcome::Deferred { reason } => ("deferred", None, Some(reason)),
            ExecutionOutcome::TransferUnrecorded { transfer_id, reason } => {
                ("transfer_unrecorded", Some(transfer_id), Some(reason))
            }
        };
        Self {
            outcome: outcome.to_string(),
            transfer_id,
            reason,
        }
    }
}

/// A payout as its instructor sees it.
#[derive(Debug, Serialize, ToSchema)]
pub struct InstructorPayoutResponse {
    pub payout_id: Uuid,
    pub year: i32,
    pub month: u32,
    pub validated_minutes: i64,
    pub payout_amount: Decimal,
    pub currency: String,
    pub status: String,
    pub transfer_id: Option<String>,
    pub error_message: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub unique_students: u32,
    pub courses: Vec<CourseDetailResponse>,
}

impl From<InstructorPayoutEntry> for InstructorPayoutResponse {
    fn from(e: InstructorPayoutEntry) -> Self {
        Self {
            payout_id: e.payout_id,
            year: e.period.year,
            month: e.period.month,
            validated_minutes: e.validated_minutes,
            payout_amount: e.payout_amount,
            currency: e.currency,
            status: e.status.as_str().to_string(),
            transfer_id: e.transfer_id,
            error_message: e.error_message,
            paid_at: e.paid_at,
            unique_students: e.unique_students,
            courses: e.courses.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PayoutStatementResponse {
    pub instructor_id: Uuid,
    pub page: usize,
    pub page_size: usize,
    pub payouts: Vec<InstructorPayoutResponse>,
    pub total_earned: Decimal,
}

impl From<PayoutStatement> for PayoutStatementResponse {
    fn from(s: PayoutStatement) -> Self {
        Self {
            instructor_id: s.instructor_id,
            page: s.page,
            page_size: s.page_size,
            payouts: s.payouts.into_iter().map(Into::into).collect(),
            total_earned: s.total_earned,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EarningsTotalResponse {
    pub instructor_id: Uuid,
    pub total_earned: Decimal,
}

//=========================================================================================
// Engagement handlers
//=========================================================================================

/// Record one engagement session.
///
/// Completed sessions with a full set of signals are scored immediately;
/// everything else waits for the batch validator.
#[utoipa::path(
    post,
    path = "/engagements",
    request_body = RecordEngagementRequest,
    responses(
        (status = 201, description = "Engagement recorded", body = EngagementResponse),
        (status = 400, description = "Malformed engagement data")
    )
)]
pub async fn record_engagement_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<RecordEngagementRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let engagement_type = payload
        .engagement_type
        .parse::<EngagementType>()
        .map_err(service_error)?;

    let report = EngagementReport {
        user_id: payload.user_id,
        course_id: payload.course_id,
        lesson_id: payload.lesson_id,
        engagement_type,
        duration_minutes: payload.duration_minutes,
        started_at: payload.started_at,
        completed_at: payload.completed_at,
        metadata: EngagementMetadata {
            ip_address: payload.ip_address,
            user_agent: payload.user_agent,
            device_fingerprint: payload.device_fingerprint,
            signals: payload.signals.into(),
            extra: payload.extra,
        },
    };

    let engagement = app_state
        .engagements
        .record_engagement(report)
        .await
        .map_err(service_error)?;
    Ok((StatusCode::CREATED, Json(EngagementResponse::from(engagement))))
}

/// Close an open session with its final signals.
#[utoipa::path(
    post,
    path = "/engagements/{id}/complete",
    request_body = CompleteSessionRequest,
    params(("id" = Uuid, Path, description = "Engagement id")),
    responses(
        (status = 200, description = "Session completed", body = EngagementResponse),
        (status = 404, description = "Unknown engagement"),
        (status = 409, description = "Session already completed or scored")
    )
)]
pub async fn complete_session_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompleteSessionRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let engagement = app_state
        .engagements
        .complete_session(
            id,
            SessionCompletion {
                completed_at: payload.completed_at,
                duration_minutes: payload.duration_minutes,
                signals: payload.signals.into(),
            },
        )
        .await
        .map_err(service_error)?;
    Ok(Json(EngagementResponse::from(engagement)))
}

#[utoipa::path(
    get,
    path = "/analytics/users/{id}",
    params(("id" = Uuid, Path, description = "Learner id"), RangeQuery),
    responses((status = 200, description = "Per-learner analytics", body = UserAnalyticsResponse))
)]
pub async fn user_analytics_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(range): Query<RangeQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let (from, before) = range.bounds()?;
    let analytics = app_state
        .engagements
        .user_analytics(id, from, before)
        .await
        .map_err(service_error)?;
    Ok(Json(UserAnalyticsResponse::from(analytics)))
}

#[utoipa::path(
    get,
    path = "/analytics/courses/{id}",
    params(("id" = Uuid, Path, description = "Course id"), RangeQuery),
    responses((status = 200, description = "Per-course analytics", body = CourseAnalyticsResponse))
)]
pub async fn course_analytics_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(range): Query<RangeQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let (from, before) = range.bounds()?;
    let analytics = app_state
        .engagements
        .course_analytics(id, from, before)
        .await
        .map_err(service_error)?;
    Ok(Json(CourseAnalyticsResponse::from(analytics)))
}

#[utoipa::path(
    get,
    path = "/analytics/instructors/{id}/{year}/{month}",
    params(
        ("id" = Uuid, Path, description = "Instructor id"),
        ("year" = i32, Path, description = "Calendar year"),
        ("month" = u32, Path, description = "Month, 1-12")
    ),
    responses(
        (status = 200, description = "Per-course breakdown of the instructor's validated minutes", body = InstructorBreakdownResponse),
        (status = 400, description = "Invalid period")
    )
)]
pub async fn instructor_breakdown_handler(
    State(app_state): State<Arc<AppState>>,
    Path((id, year, month)): Path<(Uuid, i32, u32)>,
) -> Result<impl IntoResponse, HandlerError> {
    let period = AccountingPeriod::new(month, year).map_err(service_error)?;
    let attribution = app_state
        .engagements
        .instructor_breakdown(id, period)
        .await
        .map_err(service_error)?;
    Ok(Json(InstructorBreakdownResponse::new(id, period, attribution)))
}

#[utoipa::path(
    get,
    path = "/admin/engagements/fraud-statistics",
    params(RangeQuery),
    responses((status = 200, description = "Fraud statistics", body = FraudStatisticsResponse))
)]
pub async fn fraud_statistics_handler(
    State(app_state): State<Arc<AppState>>,
    Query(range): Query<RangeQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let (from, before) = range.bounds()?;
    let stats = app_state
        .engagements
        .fraud_statistics(from, before)
        .await
        .map_err(service_error)?;
    Ok(Json(FraudStatisticsResponse::from(stats)))
}

#[utoipa::path(
    get,
    path = "/admin/engagements/suspicious",
    params(RangeQuery),
    responses((status = 200, description = "Engagements that need review", body = [EngagementResponse]))
)]
pub async fn suspicious_engagements_handler(
    State(app_state): State<Arc<AppState>>,
    Query(range): Query<RangeQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let (from, before) = range.bounds()?;
    let rows = app_state
        .engagements
        .detect_suspicious(from, before)
        .await
        .map_err(service_error)?;
    Ok(Json(rows.into_iter().map(EngagementResponse::from).collect::<Vec<_>>()))
}

#[utoipa::path(
    post,
    path = "/admin/engagements/{id}/fraud",
    request_body = FlagEngagementRequest,
    params(("id" = Uuid, Path, description = "Engagement id")),
    responses(
        (status = 200, description = "Engagement flagged", body = EngagementResponse),
        (status = 400, description = "Missing reason"),
        (status = 404, description = "Unknown engagement")
    )
)]
pub async fn flag_engagement_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FlagEngagementRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let engagement = app_state
        .engagements
        .mark_engagement_as_fraudulent(id, &payload.reason)
        .await
        .map_err(service_error)?;
    Ok(Json(EngagementResponse::from(engagement)))
}

#[utoipa::path(
    post,
    path = "/admin/engagements/{id}/rescore",
    params(("id" = Uuid, Path, description = "Engagement id")),
    responses(
        (status = 200, description = "Score recalculated", body = EngagementResponse),
        (status = 409, description = "Engagement is flagged or still open")
    )
)]
pub async fn rescore_engagement_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let engagement = app_state
        .engagements
        .recalculate_validation_score(id)
        .await
        .map_err(service_error)?;
    Ok(Json(EngagementResponse::from(engagement)))
}

//=========================================================================================
// Revenue handlers
//=========================================================================================

/// Record a paid invoice. Redeliveries return the existing row with `200`.
#[utoipa::path(
    post,
    path = "/revenue",
    request_body = RevenueRequest,
    responses(
        (status = 201, description = "Revenue recorded", body = RecordRevenueResponse),
        (status = 200, description = "Invoice already recorded or moved to paid", body = RecordRevenueResponse),
        (status = 400, description = "Malformed revenue event")
    )
)]
pub async fn record_revenue_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<RevenueRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let outcome = app_state
        .ledger
        .record_revenue(RevenueEvent {
            subscription_id: payload.subscription_id,
            amount: payload.amount,
            currency: payload.currency,
            invoice_id: payload.invoice_id,
            payment_intent_id: payload.payment_intent_id,
            payment_method: payload.payment_method,
            billing_period_start: payload.billing_period_start,
            billing_period_end: payload.billing_period_end,
            paid_at: payload.paid_at,
        })
        .await
        .map_err(service_error)?;
    Ok(outcome_response(outcome))
}

#[utoipa::path(
    post,
    path = "/revenue/failures",
    request_body = PaymentFailureRequest,
    responses(
        (status = 201, description = "Failure recorded", body = RecordRevenueResponse),
        (status = 200, description = "Failure already reflected", body = RecordRevenueResponse)
    )
)]
pub async fn record_payment_failure_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<PaymentFailureRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let outcome = app_state
        .ledger
        .record_payment_failure(PaymentFailureEvent {
            subscription_id: payload.subscription_id,
            amount: payload.amount,
            currency: payload.currency,
            invoice_id: payload.invoice_id,
            billing_period_start: payload.billing_period_start,
            billing_period_end: payload.billing_period_end,
            reason: payload.reason,
        })
        .await
        .map_err(service_error)?;
    Ok(outcome_response(outcome))
}

#[utoipa::path(
    post,
    path = "/revenue/{id}/refund",
    request_body = ReversalRequest,
    params(("id" = Uuid, Path, description = "Revenue row id")),
    responses(
        (status = 200, description = "Refund recorded", body = RecordRevenueResponse),
        (status = 409, description = "Revenue is not in a refundable state")
    )
)]
pub async fn refund_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReversalRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let outcome = app_state
        .ledger
        .record_refund(id, payload.amount, &payload.reason)
        .await
        .map_err(service_error)?;
    Ok(outcome_response(outcome))
}

#[utoipa::path(
    post,
    path = "/revenue/{id}/chargeback",
    request_body = ReversalRequest,
    params(("id" = Uuid, Path, description = "Revenue row id")),
    responses(
        (status = 200, description = "Chargeback recorded", body = RecordRevenueResponse),
        (status = 409, description = "Revenue is not in a reversible state")
    )
)]
pub async fn chargeback_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReversalRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let outcome = app_state
        .ledger
        .record_chargeback(id, payload.amount, &payload.reason)
        .await
        .map_err(service_error)?;
    Ok(outcome_response(outcome))
}

#[utoipa::path(
    get,
    path = "/admin/revenue/metrics",
    params(MetricsQuery),
    responses((status = 200, description = "Revenue metrics for the window", body = RevenueMetricsResponse))
)]
pub async fn revenue_metrics_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let metrics = app_state
        .ledger
        .revenue_metrics(query.start, query.end)
        .await
        .map_err(service_error)?;
    Ok(Json(RevenueMetricsResponse::from(metrics)))
}

#[utoipa::path(
    get,
    path = "/admin/revenue/monthly/{year}",
    params(("year" = i32, Path, description = "Calendar year")),
    responses((status = 200, description = "Twelve monthly entries", body = [MonthlyRevenueResponse]))
)]
pub async fn monthly_revenue_handler(
    State(app_state): State<Arc<AppState>>,
    Path(year): Path<i32>,
) -> Result<impl IntoResponse, HandlerError> {
    let months = app_state
        .ledger
        .monthly_breakdown(year)
        .await
        .map_err(service_error)?;
    Ok(Json(months.into_iter().map(MonthlyRevenueResponse::from).collect::<Vec<_>>()))
}

//=========================================================================================
// Payout handlers
//=========================================================================================

/// Compute the period's payouts. Existing rows are returned unchanged.
#[utoipa::path(
    post,
    path = "/admin/payouts/periods/{year}/{month}",
    params(
        ("year" = i32, Path, description = "Calendar year"),
        ("month" = u32, Path, description = "Month, 1-12")
    ),
    responses(
        (status = 200, description = "All payout rows of the period", body = [PayoutResponse]),
        (status = 400, description = "Invalid period")
    )
)]
pub async fn calculate_period_handler(
    State(app_state): State<Arc<AppState>>,
    Path((year, month)): Path<(i32, u32)>,
) -> Result<impl IntoResponse, HandlerError> {
    let payouts = app_state
        .calculator
        .calculate_all_payouts_for_period(month, year)
        .await
        .map_err(service_error)?;
    Ok(Json(payouts.into_iter().map(PayoutResponse::from).collect::<Vec<_>>()))
}

#[utoipa::path(
    get,
    path = "/admin/payouts/periods/{year}/{month}",
    params(
        ("year" = i32, Path, description = "Calendar year"),
        ("month" = u32, Path, description = "Month, 1-12")
    ),
    responses((status = 200, description = "Period summary", body = PayoutSummaryResponse))
)]
pub async fn period_summary_handler(
    State(app_state): State<Arc<AppState>>,
    Path((year, month)): Path<(i32, u32)>,
) -> Result<impl IntoResponse, HandlerError> {
    let summary = app_state
        .calculator
        .get_payout_summary(month, year)
        .await
        .map_err(service_error)?;
    Ok(Json(PayoutSummaryResponse::from(summary)))
}

#[utoipa::path(
    get,
    path = "/admin/payouts/periods/{year}/{month}/top",
    params(
        ("year" = i32, Path, description = "Calendar year"),
        ("month" = u32, Path, description = "Month, 1-12"),
        TopQuery
    ),
    responses((status = 200, description = "Highest payouts of the period", body = [InstructorEarningsResponse]))
)]
pub async fn top_earners_handler(
    State(app_state): State<Arc<AppState>>,
    Path((year, month)): Path<(i32, u32)>,
    Query(query): Query<TopQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let earners = app_state
        .calculator
        .top_earning_instructors(month, year, query.limit.unwrap_or(10))
        .await
        .map_err(service_error)?;
    Ok(Json(earners.into_iter().map(InstructorEarningsResponse::from).collect::<Vec<_>>()))
}

#[utoipa::path(
    get,
    path = "/admin/payouts/{id}",
    params(("id" = Uuid, Path, description = "Payout id")),
    responses(
        (status = 200, description = "The payout", body = PayoutResponse),
        (status = 404, description = "Unknown payout")
    )
)]
pub async fn get_payout_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let payout = app_state.calculator.get_payout(id).await.map_err(service_error)?;
    Ok(Json(PayoutResponse::from(payout)))
}

#[utoipa::path(
    post,
    path = "/admin/payouts/{id}/recalculate",
    params(("id" = Uuid, Path, description = "Payout id")),
    responses(
        (status = 200, description = "Payout recalculated and back to pending", body = PayoutResponse),
        (status = 409, description = "Payout is processing or paid")
    )
)]
pub async fn recalculate_payout_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let payout = app_state
        .calculator
        .recalculate_payout(id)
        .await
        .map_err(service_error)?;
    Ok(Json(PayoutResponse::from(payout)))
}

#[utoipa::path(
    post,
    path = "/admin/payouts/{id}/fail",
    request_body = FailPayoutRequest,
    params(("id" = Uuid, Path, description = "Payout id")),
    responses(
        (status = 200, description = "Payout marked failed", body = PayoutResponse),
        (status = 409, description = "Payout is already paid or failed")
    )
)]
pub async fn fail_payout_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FailPayoutRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let payout = app_state
        .executor
        .mark_payout_as_failed(id, &payload.reason)
        .await
        .map_err(service_error)?;
    Ok(Json(PayoutResponse::from(payout)))
}

#[utoipa::path(
    post,
    path = "/admin/payouts/{id}/retry",
    params(("id" = Uuid, Path, description = "Payout id")),
    responses(
        (status = 200, description = "Payout back to pending", body = PayoutResponse),
        (status = 409, description = "Payout is not failed")
    )
)]
pub async fn retry_payout_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let payout = app_state.executor.retry_payout(id).await.map_err(service_error)?;
    Ok(Json(PayoutResponse::from(payout)))
}

/// Execute one payout now. Transfer failures are reported in the body, not as errors.
#[utoipa::path(
    post,
    path = "/admin/payouts/{id}/execute",
    params(("id" = Uuid, Path, description = "Payout id")),
    responses(
        (status = 200, description = "Execution outcome", body = ExecutionResponse),
        (status = 409, description = "Payout cannot be executed from its current state"),
        (status = 503, description = "No transfer provider configured")
    )
)]
pub async fn execute_payout_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    if !app_state.transfers_enabled {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Transfers are disabled: no transfer API key configured".to_string(),
        ));
    }
    let outcome = app_state.executor.execute_payout(id).await.map_err(service_error)?;
    Ok(Json(ExecutionResponse::from(outcome)))
}

/// Mark a payout paid after the provider confirmed a transfer this service could not observe.
#[utoipa::path(
    post,
    path = "/admin/payouts/{id}/reconcile",
    request_body = ReconcileRequest,
    params(("id" = Uuid, Path, description = "Payout id")),
    responses(
        (status = 200, description = "Payout reconciled as paid", body = PayoutResponse),
        (status = 409, description = "Payout is pending or already paid")
    )
)]
pub async fn reconcile_payout_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReconcileRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let payout = app_state
        .executor
        .reconcile_transfer(id, &payload.transfer_id)
        .await
        .map_err(service_error)?;
    Ok(Json(PayoutResponse::from(payout)))
}

//=========================================================================================
// Instructor handlers
//=========================================================================================

#[utoipa::path(
    get,
    path = "/instructors/me/payouts",
    params(
        HistoryQuery,
        ("x-instructor-id" = Uuid, Header, description = "The calling instructor.")
    ),
    responses(
        (status = 200, description = "One page of the caller's payouts", body = PayoutStatementResponse),
        (status = 401, description = "Missing or malformed instructor id")
    )
)]
pub async fn my_payouts_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(InstructorId(instructor_id)): Extension<InstructorId>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let statement = app_state
        .calculator
        .get_instructor_payout_history(
            instructor_id,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(20),
        )
        .await
        .map_err(service_error)?;
    Ok(Json(PayoutStatementResponse::from(statement)))
}

#[utoipa::path(
    get,
    path = "/instructors/me/earnings",
    params(("x-instructor-id" = Uuid, Header, description = "The calling instructor.")),
    responses((status = 200, description = "Lifetime paid-out total", body = EarningsTotalResponse))
)]
pub async fn my_earnings_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(InstructorId(instructor_id)): Extension<InstructorId>,
) -> Result<impl IntoResponse, HandlerError> {
    let total_earned = app_state
        .calculator
        .get_instructor_total_earned(instructor_id)
        .await
        .map_err(service_error)?;
    Ok(Json(EarningsTotalResponse {
        instructor_id,
        total_earned,
    }))
}
