//! crates/revshare_core/src/domain.rs
//!
//! Defines the pure, core data structures for the revenue-share core.
//! These structs are independent of any database or transport format; the
//! serde derives exist so adapters can store metadata and breakdowns as JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{invalid, ServiceError, ServiceResult};

//=========================================================================================
// Accounting Period
//=========================================================================================

/// A calendar month used as the unit of revenue aggregation and payout computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountingPeriod {
    pub year: i32,
    pub month: u32,
}

impl AccountingPeriod {
    pub fn new(month: u32, year: i32) -> ServiceResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(invalid(format!("Invalid month {}: must be between 1 and 12", month)));
        }
        if !(2000..=2100).contains(&year) {
            return Err(invalid(format!("Invalid year {}: must be between 2000 and 2100", year)));
        }
        Ok(Self { year, month })
    }

    /// The period containing `at`.
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// Inclusive start of the period (first instant of the month, UTC).
    pub fn start(&self) -> DateTime<Utc> {
        first_instant(self.year, self.month)
    }

    /// Exclusive end of the period (first instant of the following month, UTC).
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }
}

impl fmt::Display for AccountingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

fn first_instant(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

//=========================================================================================
// Engagement
//=========================================================================================

/// Kind of interaction a learner had with course content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementType {
    VideoWatch,
    QuizAttempt,
    AssignmentSubmit,
    Reading,
    Discussion,
}

impl EngagementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementType::VideoWatch => "video_watch",
            EngagementType::QuizAttempt => "quiz_attempt",
            EngagementType::AssignmentSubmit => "assignment_submit",
            EngagementType::Reading => "reading",
            EngagementType::Discussion => "discussion",
        }
    }
}

impl FromStr for EngagementType {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video_watch" => Ok(EngagementType::VideoWatch),
            "quiz_attempt" => Ok(EngagementType::QuizAttempt),
            "assignment_submit" => Ok(EngagementType::AssignmentSubmit),
            "reading" => Ok(EngagementType::Reading),
            "discussion" => Ok(EngagementType::Discussion),
            other => Err(invalid(format!("Unknown engagement type '{}'", other))),
        }
    }
}

/// Client-reported signals for one session. Any field may be missing while
/// the session is still streaming.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSignals {
    /// Fraction of session time the tab was focused, 0..=1.
    pub tab_active_ratio: Option<f64>,
    /// Playback rate, 1.0 is normal speed.
    pub playback_speed: Option<f64>,
    pub session_seconds: Option<f64>,
    /// Length of the lesson/content being consumed, when known.
    pub content_seconds: Option<f64>,
}

impl SessionSignals {
    /// Overlays `later` on top of these signals; fields `later` omits are kept.
    pub fn merge(&mut self, later: &SessionSignals) {
        self.tab_active_ratio = later.tab_active_ratio.or(self.tab_active_ratio);
        self.playback_speed = later.playback_speed.or(self.playback_speed);
        self.session_seconds = later.session_seconds.or(self.session_seconds);
        self.content_seconds = later.content_seconds.or(self.content_seconds);
    }

    pub fn is_complete(&self) -> bool {
        self.tab_active_ratio.is_some()
            && self.playback_speed.is_some()
            && self.session_seconds.is_some()
    }
}

/// Free-form session metadata kept with the record for audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    #[serde(default)]
    pub signals: SessionSignals,
    /// Anything else the client sent (video progress, quiz score, ...).
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One recorded watch/interaction session.
#[derive(Debug, Clone, PartialEq)]
pub struct Engagement {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub lesson_id: Option<Uuid>,
    pub engagement_type: EngagementType,
    pub duration_minutes: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `None` while scoring is pending.
    pub validation_score: Option<Decimal>,
    pub counts_for_payout: bool,
    pub fraud_flagged: bool,
    pub fraud_reason: Option<String>,
    pub fraud_flagged_at: Option<DateTime<Utc>>,
    pub metadata: EngagementMetadata,
    pub validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Engagement {
    pub fn is_pending(&self) -> bool {
        self.validation_score.is_none()
    }
}

//=========================================================================================
// Subscription Revenue
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevenueStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    ChargedBack,
}

impl RevenueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevenueStatus::Pending => "pending",
            RevenueStatus::Paid => "paid",
            RevenueStatus::Failed => "failed",
            RevenueStatus::Refunded => "refunded",
            RevenueStatus::ChargedBack => "charged_back",
        }
    }
}

impl fmt::Display for RevenueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevenueStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RevenueStatus::Pending),
            "paid" => Ok(RevenueStatus::Paid),
            "failed" => Ok(RevenueStatus::Failed),
            "refunded" => Ok(RevenueStatus::Refunded),
            "charged_back" => Ok(RevenueStatus::ChargedBack),
            other => Err(invalid(format!("Unknown revenue status '{}'", other))),
        }
    }
}

/// One monetary event tied to a subscription billing cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRevenue {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    /// Upstream invoice id; unique when present.
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub payment_method: Option<String>,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub status: RevenueStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    /// Refunded or charged-back amount, never above `amount`.
    pub refund_amount: Option<Decimal>,
    pub refund_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Instructor Payout
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Paid,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "processing" => Ok(PayoutStatus::Processing),
            "paid" => Ok(PayoutStatus::Paid),
            "failed" => Ok(PayoutStatus::Failed),
            other => Err(invalid(format!("Unknown payout status '{}'", other))),
        }
    }
}

/// The named transitions of the payout state machine. Admin overrides are
/// transitions like any other, with their own allowed source states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutTransition {
    /// Claim for execution.
    Claim,
    /// Give a claimed payout back when the destination turned out ineligible.
    Release,
    Complete,
    Fail,
    Retry,
    Recalculate,
    /// Admin correction after the provider confirmed an uncertain transfer.
    Reconcile,
}

impl PayoutTransition {
    pub fn allowed_from(&self) -> &'static [PayoutStatus] {
        use PayoutStatus::*;
        match self {
            PayoutTransition::Claim => &[Pending],
            PayoutTransition::Release => &[Processing],
            PayoutTransition::Complete => &[Processing],
            PayoutTransition::Fail => &[Pending, Processing],
            PayoutTransition::Retry => &[Failed],
            PayoutTransition::Recalculate => &[Pending, Failed],
            PayoutTransition::Reconcile => &[Processing, Failed],
        }
    }

    pub fn target(&self) -> PayoutStatus {
        match self {
            PayoutTransition::Claim => PayoutStatus::Processing,
            PayoutTransition::Complete | PayoutTransition::Reconcile => PayoutStatus::Paid,
            PayoutTransition::Fail => PayoutStatus::Failed,
            PayoutTransition::Release
            | PayoutTransition::Retry
            | PayoutTransition::Recalculate => PayoutStatus::Pending,
        }
    }

    /// Checks that the transition may be applied to a payout currently in `from`.
    pub fn check(&self, payout_id: Uuid, from: PayoutStatus) -> ServiceResult<PayoutStatus> {
        if self.allowed_from().contains(&from) {
            Ok(self.target())
        } else {
            Err(ServiceError::InvalidTransition {
                entity: "payout",
                id: payout_id,
                from: from.to_string(),
                to: self.target().to_string(),
            })
        }
    }
}

/// Per-course engagement that contributed to a payout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseEngagementDetail {
    pub course_id: Uuid,
    pub validated_minutes: i64,
    pub unique_students: u32,
    pub engagements: u32,
}

/// Audit breakdown stored alongside a payout; not used in the formula.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutBreakdown {
    pub courses: Vec<CourseEngagementDetail>,
    pub unique_students: u32,
    pub engagements: u32,
}

/// The derived fields of a payout, produced by the calculator.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutCalculation {
    pub instructor_minutes: i64,
    pub platform_minutes: i64,
    pub platform_revenue: Decimal,
    pub engagement_percentage: Decimal,
    pub commission_rate: Decimal,
    pub payout_amount: Decimal,
    pub breakdown: PayoutBreakdown,
}

/// One computed payout for one instructor for one accounting period.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructorPayout {
    pub id: Uuid,
    pub instructor_id: Uuid,
    pub period: AccountingPeriod,
    pub calculation: PayoutCalculation,
    pub currency: String,
    pub status: PayoutStatus,
    pub transfer_id: Option<String>,
    pub error_message: Option<String>,
    /// Set when the single transfer attempt for the current claim begins.
    pub transfer_started_at: Option<DateTime<Utc>>,
    /// Bumped each time a failed payout is retried with a fresh transfer;
    /// part of the provider idempotency key.
    pub transfer_attempt: u32,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstructorPayout {
    pub fn amount(&self) -> Decimal {
        self.calculation.payout_amount
    }

    /// Idempotency key sent with the transfer for the current attempt.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.id, self.transfer_attempt)
    }
}

//=========================================================================================
// Collaborator mirrors
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    Pending,
    Incomplete,
    Complete,
    Restricted,
    Disabled,
}

impl OnboardingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnboardingStatus::Pending => "pending",
            OnboardingStatus::Incomplete => "incomplete",
            OnboardingStatus::Complete => "complete",
            OnboardingStatus::Restricted => "restricted",
            OnboardingStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for OnboardingStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OnboardingStatus::Pending),
            "incomplete" => Ok(OnboardingStatus::Incomplete),
            "complete" => Ok(OnboardingStatus::Complete),
            "restricted" => Ok(OnboardingStatus::Restricted),
            "disabled" => Ok(OnboardingStatus::Disabled),
            other => Err(invalid(format!("Unknown onboarding status '{}'", other))),
        }
    }
}

/// Local mirror of an instructor's external payout destination.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructorConnectAccount {
    pub instructor_id: Uuid,
    pub external_account_id: String,
    pub onboarding_status: OnboardingStatus,
    pub payouts_enabled: bool,
    pub charges_enabled: bool,
    pub total_paid_out: Decimal,
    pub last_payout_at: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disabled_reason: Option<String>,
}

impl InstructorConnectAccount {
    pub fn can_receive_payouts(&self) -> bool {
        self.payouts_enabled && self.disabled_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

/// A subscription that is active at some instant, with its plan's contracted price.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSubscription {
    pub subscription_id: Uuid,
    pub plan_name: String,
    pub billing_interval: BillingInterval,
    pub price_monthly: Decimal,
    pub price_yearly: Option<Decimal>,
}

impl ActiveSubscription {
    /// Contracted recurring value normalized to one month.
    pub fn monthly_value(&self) -> Decimal {
        match self.billing_interval {
            BillingInterval::Monthly => self.price_monthly,
            BillingInterval::Yearly => match self.price_yearly {
                Some(yearly) => yearly / Decimal::from(12),
                None => self.price_monthly,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_bounds_roll_over_the_year() {
        let dec = AccountingPeriod::new(12, 2024).unwrap();
        assert_eq!(dec.start(), Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(dec.end(), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(dec.to_string(), "2024-12");
    }

    #[test]
    fn period_rejects_out_of_range_month() {
        assert!(matches!(
            AccountingPeriod::new(13, 2024),
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(AccountingPeriod::new(0, 2024).is_err());
    }

    #[test]
    fn paid_payout_cannot_leave_paid_through_any_transition() {
        let id = Uuid::new_v4();
        for t in [
            PayoutTransition::Claim,
            PayoutTransition::Release,
            PayoutTransition::Complete,
            PayoutTransition::Fail,
            PayoutTransition::Retry,
            PayoutTransition::Recalculate,
            PayoutTransition::Reconcile,
        ] {
            assert!(t.check(id, PayoutStatus::Paid).is_err(), "{:?} left paid", t);
        }
    }

    #[test]
    fn failed_payout_only_returns_to_pending_explicitly() {
        let id = Uuid::new_v4();
        assert_eq!(
            PayoutTransition::Retry.check(id, PayoutStatus::Failed).unwrap(),
            PayoutStatus::Pending
        );
        assert!(PayoutTransition::Claim.check(id, PayoutStatus::Failed).is_err());
        assert!(PayoutTransition::Complete.check(id, PayoutStatus::Failed).is_err());
    }

    #[test]
    fn signals_merge_overlays_later_values() {
        let mut first = SessionSignals {
            tab_active_ratio: Some(0.9),
            ..Default::default()
        };
        first.merge(&SessionSignals {
            tab_active_ratio: Some(0.1),
            playback_speed: Some(1.0),
            session_seconds: Some(600.0),
            content_seconds: None,
        });
        assert_eq!(first.tab_active_ratio, Some(0.1));
        assert!(first.is_complete());
    }

    #[test]
    fn yearly_subscription_normalizes_to_monthly() {
        let sub = ActiveSubscription {
            subscription_id: Uuid::new_v4(),
            plan_name: "Pro".into(),
            billing_interval: BillingInterval::Yearly,
            price_monthly: Decimal::from(15),
            price_yearly: Some(Decimal::from(120)),
        };
        assert_eq!(sub.monthly_value(), Decimal::from(10));
    }
}
