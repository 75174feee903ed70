//! crates/revshare_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the revenue-share core.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the relational store and the external transfer provider.
//!
//! Every state change on a store is a compare-and-set: the update names the
//! state it expects and reports whether it won. Uniqueness (invoice id,
//! instructor + period) is enforced by the store itself, not by a prior read.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    AccountingPeriod, ActiveSubscription, Engagement, EngagementMetadata, InstructorConnectAccount,
    InstructorPayout, PayoutCalculation, PayoutStatus, RevenueStatus, SubscriptionRevenue,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Engagement storage
//=========================================================================================

/// Filter for engagement listings. Start bounds are half-open: `[from, before)`.
#[derive(Debug, Clone)]
pub struct EngagementQuery {
    pub user_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub started_from: DateTime<Utc>,
    pub started_before: DateTime<Utc>,
}

/// Qualifying (counts-for-payout) minutes aggregated per course and learner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifyingMinutes {
    pub course_id: Uuid,
    pub user_id: Uuid,
    pub minutes: i64,
    pub engagements: i64,
}

#[async_trait]
pub trait EngagementStore: Send + Sync {
    async fn insert_engagement(&self, engagement: &Engagement) -> PortResult<()>;

    async fn get_engagement(&self, id: Uuid) -> PortResult<Engagement>;

    /// Whether `fingerprint` appears on one of the user's unflagged engagements
    /// started strictly before `started_before`.
    async fn fingerprint_seen(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        started_before: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// Stamps completion on an open, unscored record. Returns `false` if the
    /// record was already completed or scored.
    async fn complete_session(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        duration_minutes: u32,
        metadata: &EngagementMetadata,
    ) -> PortResult<bool>;

    /// Completed records with a pending score, oldest completion first.
    async fn pending_validation(
        &self,
        completed_after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> PortResult<Vec<Engagement>>;

    /// Sets the first automatic score. Returns `false` if the record is no longer pending.
    async fn apply_validation(
        &self,
        id: Uuid,
        score: Decimal,
        counts_for_payout: bool,
        at: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// Overwrites the score of a record that is not fraud-flagged.
    async fn override_validation(
        &self,
        id: Uuid,
        score: Decimal,
        counts_for_payout: bool,
        at: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// Flags the record fraudulent (score 0, not counting). Returns `false` if already flagged.
    async fn flag_fraudulent(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> PortResult<bool>;

    async fn list_engagements(&self, query: &EngagementQuery) -> PortResult<Vec<Engagement>>;

    /// Counts-for-payout minutes with a start in `[start, end)`, grouped by course and learner.
    async fn qualifying_minutes(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PortResult<Vec<QualifyingMinutes>>;
}

//=========================================================================================
// Revenue storage
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RevenueStatusChange {
    Paid { paid_at: DateTime<Utc> },
    Failed { reason: String, failed_at: DateTime<Utc> },
    Refunded { amount: Decimal, reason: String, refunded_at: DateTime<Utc> },
    ChargedBack { amount: Decimal, reason: String, charged_back_at: DateTime<Utc> },
}

impl RevenueStatusChange {
    pub fn target(&self) -> RevenueStatus {
        match self {
            RevenueStatusChange::Paid { .. } => RevenueStatus::Paid,
            RevenueStatusChange::Failed { .. } => RevenueStatus::Failed,
            RevenueStatusChange::Refunded { .. } => RevenueStatus::Refunded,
            RevenueStatusChange::ChargedBack { .. } => RevenueStatus::ChargedBack,
        }
    }
}

/// Ledger counters for a date range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevenueStats {
    /// Sum of paid rows whose `paid_at` falls in the range.
    pub paid_total: Decimal,
    pub paid_count: i64,
    pub failed_count: i64,
    pub refunded_count: i64,
    pub charged_back_count: i64,
}

#[async_trait]
pub trait RevenueStore: Send + Sync {
    /// Inserts the row unless another row already carries its invoice id.
    /// Returns `false` on that conflict.
    async fn insert_revenue(&self, revenue: &SubscriptionRevenue) -> PortResult<bool>;

    async fn get_revenue(&self, id: Uuid) -> PortResult<SubscriptionRevenue>;

    async fn find_by_invoice(&self, invoice_id: &str) -> PortResult<Option<SubscriptionRevenue>>;

    async fn update_revenue_status(
        &self,
        id: Uuid,
        expected: RevenueStatus,
        change: &RevenueStatusChange,
    ) -> PortResult<bool>;

    /// Sum of `paid` amounts with `paid_at` in `[start, end)`.
    async fn total_paid(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PortResult<Decimal>;

    async fn revenue_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> PortResult<RevenueStats>;
}

//=========================================================================================
// Payout storage
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PayoutStatusChange {
    Processing,
    /// `transfer_id` is `None` only for zero-amount payouts that need no transfer.
    Paid { transfer_id: Option<String> },
    Failed { reason: String },
    /// Back to pending; clears the error and the transfer slot. With
    /// `next_attempt` the next transfer goes out under a new idempotency key.
    Pending { next_attempt: bool },
}

impl PayoutStatusChange {
    pub fn target(&self) -> PayoutStatus {
        match self {
            PayoutStatusChange::Processing => PayoutStatus::Processing,
            PayoutStatusChange::Paid { .. } => PayoutStatus::Paid,
            PayoutStatusChange::Failed { .. } => PayoutStatus::Failed,
            PayoutStatusChange::Pending { .. } => PayoutStatus::Pending,
        }
    }
}

#[async_trait]
pub trait PayoutStore: Send + Sync {
    /// Inserts unless a row exists for the same instructor and period. Returns `false` on conflict.
    async fn insert_payout(&self, payout: &InstructorPayout) -> PortResult<bool>;

    async fn get_payout(&self, id: Uuid) -> PortResult<InstructorPayout>;

    async fn find_payout(
        &self,
        instructor_id: Uuid,
        period: AccountingPeriod,
    ) -> PortResult<Option<InstructorPayout>>;

    async fn payouts_for_period(&self, period: AccountingPeriod) -> PortResult<Vec<InstructorPayout>>;

    /// Newest period first.
    async fn payouts_for_instructor(
        &self,
        instructor_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> PortResult<Vec<InstructorPayout>>;

    /// Oldest first. For `processing`, only payouts whose transfer slot is unclaimed.
    async fn payouts_with_status(
        &self,
        status: PayoutStatus,
        limit: usize,
    ) -> PortResult<Vec<InstructorPayout>>;

    async fn update_payout_status(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        change: &PayoutStatusChange,
        at: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// Claims the single transfer attempt of a processing payout.
    async fn claim_transfer(&self, id: Uuid, at: DateTime<Utc>) -> PortResult<bool>;

    /// Overwrites the derived fields and resets the payout to pending.
    async fn replace_calculation(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        calculation: &PayoutCalculation,
        at: DateTime<Utc>,
    ) -> PortResult<bool>;

    async fn total_paid_to(&self, instructor_id: Uuid) -> PortResult<Decimal>;
}

//=========================================================================================
// Collaborators
//=========================================================================================

#[async_trait]
pub trait CourseCatalog: Send + Sync {
    /// Owning instructor per course; unknown courses are absent from the map.
    async fn course_owners(&self, course_ids: &[Uuid]) -> PortResult<HashMap<Uuid, Uuid>>;
}

#[async_trait]
pub trait ConnectAccountDirectory: Send + Sync {
    async fn connect_account(&self, instructor_id: Uuid) -> PortResult<Option<InstructorConnectAccount>>;

    /// Adds to the lifetime paid-out total after a confirmed transfer.
    async fn record_payout(
        &self,
        instructor_id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> PortResult<()>;
}

#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn active_subscriptions(&self, as_of: DateTime<Utc>) -> PortResult<Vec<ActiveSubscription>>;
}

//=========================================================================================
// External transfer provider
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub destination_account_id: String,
    pub amount: Decimal,
    pub currency: String,
    /// Forwarded to the provider so a replayed request cannot pay twice.
    pub idempotency_key: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountStatus {
    pub payouts_enabled: bool,
    pub charges_enabled: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    /// The provider answered and refused the transfer.
    #[error("Transfer rejected: {0}")]
    Rejected(String),
    /// The request never reached the provider.
    #[error("Transfer provider unavailable: {0}")]
    Unavailable(String),
    /// No answer in time; the transfer may or may not have happened.
    #[error("Transfer timed out")]
    TimedOut,
}

#[async_trait]
pub trait TransferProvider: Send + Sync {
    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError>;

    async fn account_status(&self, account_id: &str) -> Result<AccountStatus, TransferError>;
}
